//! Active sessions plus the persisted memory of finished ones.
//!
//! A session id is either active or stored, never both. Finishing a session
//! scores it, moves it into memory, rewrites the memory file and rebuilds
//! the retrieval index. If the index or the rewrite fails the session goes back
//! to the active map.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embeddings::Embedder;
use crate::error::ServiceError;
use crate::feedback::FeedbackClassifier;
use crate::session::{now_ms, score_turns, Outcome, Session};
use crate::vector_index::SessionIndex;

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub score: f64,
    pub outcome: Outcome,
    pub tests_passed: bool,
    pub error_count: usize,
    pub chain_length: usize,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            score: s.score,
            outcome: s.outcome,
            tests_passed: s.tests_passed,
            error_count: s.error_count,
            chain_length: s.chain_length,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub position: usize,
    pub session_id: String,
    pub initial_question: String,
    pub similarity: f32,
    pub score: f64,
}

pub struct SessionStore {
    active: HashMap<String, Session>,
    memory: Vec<Session>,
    index: SessionIndex,
    path: PathBuf,
    embedder: Arc<dyn Embedder>,
    classifier: Arc<FeedbackClassifier>,
}

impl SessionStore {
    /// Loads the memory file (a missing file means empty memory) and builds the index.
    pub fn open(path: impl Into<PathBuf>, embedder: Arc<dyn Embedder>, classifier: Arc<FeedbackClassifier>) -> Result<Self> {
        let path = path.into();
        let memory = load_memory(&path)?;
        let mut store = Self {
            active: HashMap::new(),
            memory,
            index: SessionIndex::default(),
            path,
            embedder,
            classifier,
        };
        store.index = store.build_index()?;
        info!(sessions = store.memory.len(), path = %store.path.display(), "session memory loaded");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &[Session] {
        &self.memory
    }

    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self, id: &str) -> Option<&Session> {
        self.active.get(id)
    }

    pub fn active_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.active.get_mut(id)
    }

    pub fn stored(&self, id: &str) -> Option<&Session> {
        self.memory.iter().find(|s| s.session_id == id)
    }

    /// Returns the active session for `id`, creating it with `question` as its
    /// initial question when absent. Repeated calls leave an existing session untouched.
    pub fn get_or_create(&mut self, id: &str, question: &str) -> &mut Session {
        self.active.entry(id.to_string()).or_insert_with(|| {
            debug!(session_id = id, "session created");
            Session::new(id, question)
        })
    }

    pub fn record_turn(&mut self, id: &str, q: &str, a: &str) -> Result<usize, ServiceError> {
        let session = self.active.get_mut(id).ok_or_else(|| ServiceError::session_not_found(id))?;
        session.push_turn(q, a);
        debug!(session_id = id, chain_length = session.chain_length, "turn recorded");
        Ok(session.chain_length)
    }

    /// Scores the session, moves it from the active map to memory and persists memory.
    pub fn end_session(&mut self, id: &str, final_code: &str, final_output: &str) -> Result<SessionSummary, ServiceError> {
        let mut session = self.active.remove(id).ok_or_else(|| ServiceError::session_not_found(id))?;

        let questions: Vec<&str> = session.question_chain.iter().map(|t| t.q.as_str()).collect();
        let signals = match self.classifier.classify_batch(&questions) {
            Ok(s) => s,
            Err(e) => {
                self.active.insert(id.to_string(), session);
                return Err(ServiceError::Internal(e.context("failed to classify turns")));
            }
        };
        let card = score_turns(&signals);
        session.apply_scorecard(&card);
        session.final_code = final_code.to_string();
        session.final_output = final_output.to_string();
        session.ended_at = Some(now_ms());
        session.hidden_context = None;

        let summary = SessionSummary::from(&session);
        self.memory.push(session);
        let index = match self.build_index().and_then(|index| self.persist().map(|_| index)) {
            Ok(index) => index,
            Err(e) => {
                if let Some(mut restored) = self.memory.pop() {
                    restored.ended_at = None;
                    self.active.insert(id.to_string(), restored);
                }
                return Err(ServiceError::Internal(e));
            }
        };
        self.index = index;
        info!(session_id = id, score = summary.score, outcome = ?summary.outcome, "session finalized");
        Ok(summary)
    }

    /// Nearest stored sessions for an embedded question, re-ranked by score
    /// (highest first). Sessions with equal score keep their nearest-first order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Vec<Candidate> {
        let k = top_k.min(self.memory.len());
        if k == 0 || self.index.is_empty() {
            return Vec::new();
        }
        let mut candidates: Vec<Candidate> = self
            .index
            .search(query, k)
            .into_iter()
            .filter_map(|(position, similarity)| {
                self.memory.get(position).map(|s| Candidate {
                    position,
                    session_id: s.session_id.clone(),
                    initial_question: s.initial_question.clone(),
                    similarity,
                    score: s.score,
                })
            })
            .collect();
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates
    }

    pub fn retrieve(&self, query: &[f32], top_k: usize) -> Option<&Session> {
        let best = self.search(query, top_k).into_iter().next();
        best.and_then(|c| self.memory.get(c.position))
    }

    /// Adds seed sessions to memory. Records are re-scored; ids that already
    /// exist (stored or active) are skipped. Returns the number imported.
    pub fn import(&mut self, records: Vec<Session>) -> Result<usize> {
        let mut known: HashSet<String> = self.memory.iter().map(|s| s.session_id.clone()).collect();
        known.extend(self.active.keys().cloned());
        let mut accepted = Vec::with_capacity(records.len());
        for mut record in records {
            if record.session_id.trim().is_empty() {
                record.session_id = uuid::Uuid::new_v4().to_string();
            }
            if !known.insert(record.session_id.clone()) {
                warn!(session_id = %record.session_id, "skipping duplicate seed session");
                continue;
            }
            if record.initial_question.is_empty() {
                if let Some(first) = record.question_chain.first() {
                    record.initial_question = first.q.clone();
                }
            }
            let questions: Vec<&str> = record.question_chain.iter().map(|t| t.q.as_str()).collect();
            let signals = self
                .classifier
                .classify_batch(&questions)
                .with_context(|| format!("failed to score seed session {}", record.session_id))?;
            record.apply_scorecard(&score_turns(&signals));
            if record.created_at == 0 {
                record.created_at = now_ms();
            }
            accepted.push(record);
        }

        let imported = accepted.len();
        if imported > 0 {
            let before = self.memory.len();
            self.memory.extend(accepted);
            match self.build_index().and_then(|index| self.persist().map(|_| index)) {
                Ok(index) => self.index = index,
                Err(e) => {
                    self.memory.truncate(before);
                    return Err(e);
                }
            }
        }
        info!(imported, total = self.memory.len(), "seed sessions imported");
        Ok(imported)
    }

    fn build_index(&self) -> Result<SessionIndex> {
        let questions: Vec<&str> = self.memory.iter().map(|s| s.initial_question.as_str()).collect();
        SessionIndex::build(self.embedder.as_ref(), &questions).context("failed to build session index")
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.memory)?;
        std::fs::write(&tmp, bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

pub fn load_memory(path: &Path) -> Result<Vec<Session>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
