//! Feedback sentiment detection by similarity to fixed example phrases.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::embeddings::{cosine_similarity, Embedder};

pub const DEFAULT_THRESHOLD: f32 = 0.6;

const POSITIVE_EXAMPLES: &[&str] = &[
    "thanks, that worked",
    "it works now",
    "perfect, that fixed it",
    "great, the tests pass now",
    "that solved my problem",
    "awesome, thank you",
    "this is exactly what I needed",
    "the code runs correctly now",
];

const NEGATIVE_EXAMPLES: &[&str] = &[
    "that didn't work",
    "still getting an error",
    "it's still broken",
    "this is wrong",
    "the tests are failing",
    "that doesn't fix the problem",
    "I get the same error",
    "no, that is not what I asked",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FeedbackSignal {
    pub positive: bool,
    pub negative: bool,
    pub positive_similarity: f32,
    pub negative_similarity: f32,
}

pub struct FeedbackClassifier {
    embedder: Arc<dyn Embedder>,
    positive: Vec<Vec<f32>>,
    negative: Vec<Vec<f32>>,
    threshold: f32,
}

impl FeedbackClassifier {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32) -> Result<Self> {
        let positive = embedder.embed_batch(POSITIVE_EXAMPLES)?;
        let negative = embedder.embed_batch(NEGATIVE_EXAMPLES)?;
        Ok(Self { embedder, positive, negative, threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn classify(&self, text: &str) -> Result<FeedbackSignal> {
        let v = self.embedder.embed(text)?;
        Ok(self.classify_vector(&v))
    }

    pub async fn classify_blocking(self: Arc<Self>, text: String) -> Result<FeedbackSignal> {
        tokio::task::spawn_blocking(move || self.classify(&text))
            .await
            .context("classification task failed")?
    }

    pub fn classify_batch(&self, texts: &[&str]) -> Result<Vec<FeedbackSignal>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vecs = self.embedder.embed_batch(texts)?;
        Ok(vecs.iter().map(|v| self.classify_vector(v)).collect())
    }

    fn classify_vector(&self, v: &[f32]) -> FeedbackSignal {
        let positive_similarity = max_similarity(v, &self.positive);
        let negative_similarity = max_similarity(v, &self.negative);
        FeedbackSignal {
            positive: positive_similarity > self.threshold,
            negative: negative_similarity > self.threshold,
            positive_similarity,
            negative_similarity,
        }
    }
}

fn max_similarity(v: &[f32], examples: &[Vec<f32>]) -> f32 {
    examples
        .iter()
        .map(|e| cosine_similarity(v, e))
        .fold(0.0f32, f32::max)
}
