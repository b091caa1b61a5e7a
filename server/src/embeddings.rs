use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};

pub const EMBED_DIM: usize = 384;

/// Turns text into fixed-length vectors.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.embed_batch(&[text])?;
        Ok(out.pop().unwrap_or_else(|| vec![0.0; self.dim()]))
    }
}

/// Deterministic bag-of-words embedder: each token is hashed into one of
/// `dim` buckets with a hash-derived sign, then the vector is L2-normalized.
pub struct HashingEmbedder {
    dim: usize,
    token_re: Regex,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        // Pattern is a literal; compilation cannot fail.
        let token_re = Regex::new(r"[a-z0-9]+(?:'[a-z]+)?").unwrap();
        Self { dim: dim.max(1), token_re }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        let lower = text.to_lowercase();
        for m in self.token_re.find_iter(&lower) {
            let digest = Sha256::digest(m.as_str().as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize % self.dim;
            let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize(&mut v);
        v
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBED_DIM)
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(feature = "fastembed")]
pub struct MiniLmEmbedder {
    model: std::sync::Mutex<fastembed::TextEmbedding>,
}

#[cfg(feature = "fastembed")]
impl MiniLmEmbedder {
    pub fn new() -> Result<Self> {
        use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
        let model = TextEmbedding::try_new(InitOptions::new(EmbeddingModel::AllMiniLML6V2))?;
        Ok(Self { model: std::sync::Mutex::new(model) })
    }
}

#[cfg(feature = "fastembed")]
impl Embedder for MiniLmEmbedder {
    fn dim(&self) -> usize {
        EMBED_DIM
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .model
            .lock()
            .map_err(|_| anyhow::anyhow!("embedding model lock poisoned"))?;
        let docs: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        model.embed(docs, None)
    }
}

#[cfg(not(feature = "fastembed"))]
pub fn default_embedder() -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(HashingEmbedder::default()))
}

#[cfg(feature = "fastembed")]
pub fn default_embedder() -> Result<Arc<dyn Embedder>> {
    Ok(Arc::new(MiniLmEmbedder::new()?))
}

/// Runs [`Embedder::embed`] on the blocking thread pool.
pub async fn embed_blocking(embedder: Arc<dyn Embedder>, text: String) -> Result<Vec<f32>> {
    tokio::task::spawn_blocking(move || embedder.embed(&text))
        .await
        .context("embedding task failed")?
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for i in 0..a.len().min(b.len()) {
        let x = a[i];
        let y = b[i];
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

fn normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
