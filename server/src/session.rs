use serde::{Deserialize, Serialize};

use crate::feedback::FeedbackSignal;

/// Chains longer than this with no clear success or failure are penalized.
pub const LONG_CHAIN: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub q: String,
    pub a: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    #[default]
    Unclear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub initial_question: String,
    #[serde(default)]
    pub question_chain: Vec<Turn>,
    #[serde(default)]
    pub final_code: String,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub final_output: String,
    #[serde(default)]
    pub tests_passed: bool,
    #[serde(default)]
    pub error_count: usize,
    #[serde(default)]
    pub chain_length: usize,
    #[serde(default)]
    pub outcome: Outcome,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    /// Rendered context from a retrieved session, reused across turns.
    #[serde(skip)]
    pub hidden_context: Option<String>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, initial_question: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            initial_question: initial_question.into(),
            question_chain: Vec::new(),
            final_code: String::new(),
            score: 0.0,
            final_output: String::new(),
            tests_passed: false,
            error_count: 0,
            chain_length: 0,
            outcome: Outcome::Unclear,
            created_at: now_ms(),
            ended_at: None,
            hidden_context: None,
        }
    }

    pub fn push_turn(&mut self, q: impl Into<String>, a: impl Into<String>) {
        self.question_chain.push(Turn { q: q.into(), a: a.into() });
        self.chain_length = self.question_chain.len();
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.question_chain.last()
    }

    pub fn apply_scorecard(&mut self, card: &Scorecard) {
        self.outcome = card.outcome;
        self.score = card.score;
        self.tests_passed = card.outcome == Outcome::Success;
        self.error_count = card.negative_count;
        self.chain_length = card.chain_length;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Scorecard {
    pub outcome: Outcome,
    pub score: f64,
    pub negative_count: usize,
    pub chain_length: usize,
}

/// Scores a finished chain from its per-turn feedback signals, oldest first.
///
/// Only the last turn decides success. The reward takes the first rule
/// that matches: a positive last turn is +1.0, any negative turn is -0.5,
/// a chain longer than [`LONG_CHAIN`] is -0.3, anything else is 0.0.
pub fn score_turns(signals: &[FeedbackSignal]) -> Scorecard {
    let chain_length = signals.len();
    let negative_count = signals.iter().filter(|s| s.negative).count();
    let last_positive = signals.last().map(|s| s.positive).unwrap_or(false);

    let outcome = if last_positive {
        Outcome::Success
    } else if negative_count > 0 {
        Outcome::Failure
    } else {
        Outcome::Unclear
    };

    let score = if last_positive {
        1.0
    } else if negative_count > 0 {
        -0.5
    } else if chain_length > LONG_CHAIN {
        -0.3
    } else {
        0.0
    };

    Scorecard { outcome, score, negative_count, chain_length }
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
