use std::cmp::Ordering;

use anyhow::{bail, Result};
use rayon::prelude::*;

use crate::embeddings::{cosine_similarity, Embedder};

/// Exact nearest-neighbor index over session initial-question embeddings.
/// Entry `i` corresponds to position `i` of the session memory array.
#[derive(Default)]
pub struct SessionIndex {
    dim: usize,
    vectors: Vec<Vec<f32>>,
}

impl SessionIndex {
    /// Embeds every question and builds a fresh index in input order.
    pub fn build(embedder: &dyn Embedder, questions: &[&str]) -> Result<Self> {
        let dim = embedder.dim();
        if questions.is_empty() {
            return Ok(Self { dim, vectors: Vec::new() });
        }
        let vectors = embedder.embed_batch(questions)?;
        if vectors.len() != questions.len() {
            bail!("embedder returned {} vectors for {} questions", vectors.len(), questions.len());
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            bail!("embedding dimension mismatch: expected {}, got {}", dim, bad.len());
        }
        Ok(Self { dim, vectors })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        self.vectors.get(position).map(|v| v.as_slice())
    }

    /// Returns up to `k` (position, similarity) pairs, most similar first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        let k = k.min(self.vectors.len());
        if k == 0 {
            return Vec::new();
        }
        let mut hits: Vec<(usize, f32)> = self
            .vectors
            .par_iter()
            .enumerate()
            .map(|(i, v)| (i, cosine_similarity(query, v)))
            .collect();
        hits.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        hits.truncate(k);
        hits
    }
}
