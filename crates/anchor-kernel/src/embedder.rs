//! Embedding drivers.
//!
//! The kernel consumes the [`Embedder`] trait and never sees model details.
//! Two drivers ship here: an OpenAI-compatible HTTP driver for any provider
//! exposing `/v1/embeddings`, and an offline token-hash driver used when no
//! embedding service is configured (and throughout the test suite).

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::debug;

use anchor_types::error::{AnchorError, AnchorResult};

/// Maps text to a fixed-length unit vector. Implementations must be
/// thread-safe; the kernel and the governor share one instance.
pub trait Embedder: Send + Sync {
    /// Compute the embedding for one text.
    fn embed(&self, text: &str) -> AnchorResult<Vec<f32>>;

    /// Dimensionality of produced vectors.
    fn dimensions(&self) -> usize;
}

/// Scale a vector to unit length. Zero vectors are returned unchanged.
pub fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// OpenAI-compatible embedding driver.
///
/// Works against any provider implementing the `/v1/embeddings` endpoint.
/// Blocking by design; this is one of the kernel's two admissible
/// suspension points.
pub struct OpenAiEmbedder {
    base_url: String,
    model: String,
    api_key: Option<String>,
    dims: usize,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    /// Create a driver for the given endpoint and model.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        dims: usize,
    ) -> AnchorResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AnchorError::Internal(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            dims,
            client,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn embed(&self, text: &str) -> AnchorResult<Vec<f32>> {
        let url = format!("{}/v1/embeddings", self.base_url);
        let mut request = self.client.post(&url).json(&EmbedRequest {
            model: &self.model,
            input: &[text],
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request
            .send()
            .map_err(|e| AnchorError::Embedding(format!("http error: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(AnchorError::Embedding(format!(
                "embedding endpoint returned {status}: {body}"
            )));
        }
        let parsed: EmbedResponse = resp
            .json()
            .map_err(|e| AnchorError::Embedding(format!("parse error: {e}")))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| AnchorError::Embedding("empty embedding response".to_string()))?;
        if vector.len() != self.dims {
            return Err(AnchorError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }
        debug!(model = %self.model, "embedded text");
        Ok(normalize(vector))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Deterministic offline embedder: hashed bag-of-words.
///
/// Each lowercase alphanumeric token hashes into a bucket; the bucket counts
/// are unit-normalized. Texts sharing tokens get positive cosine similarity,
/// which is enough for exact-recall workloads and for tests. Identical input
/// always produces the identical vector.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    /// Create a hash embedder with the given dimensionality.
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> AnchorResult<Vec<f32>> {
        let mut v = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dims as u64) as usize;
            v[bucket] += 1.0;
        }
        Ok(normalize(v))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
