//! Embedding client capability and vector math helpers.
//!
//! Vectors are fixed dimension (default 1536), f32, unit-normalized at the
//! client boundary so cosine similarity downstream stays meaningful. Empty
//! input returns empty output without touching the backend. Failures surface
//! to the caller; there is no silent fallback vector.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EmbeddingSettings;
use crate::error::{CoreError, CoreResult};

// ─── Capability ─────────────────────────────────────────────────────────────

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Fixed output dimension.
    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;
}

// ─── Vector math ────────────────────────────────────────────────────────────

/// Scale `v` to unit L2 norm in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Component-wise average of `vectors`, re-normalized to unit length.
///
/// This is the similarity-preserving aggregation used when a property's
/// description spans several chunks: the mean direction keeps cosine
/// comparability, and the final normalization restores unit norm.
pub fn mean_unit_vector(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dim = first.len();
    let mut mean = vec![0.0f32; dim];
    for vector in vectors {
        for (acc, x) in mean.iter_mut().zip(vector.iter()) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    for x in mean.iter_mut() {
        *x /= n;
    }
    l2_normalize(&mut mean);
    Some(mean)
}

/// Cosine similarity between two vectors (0.0 when either is degenerate).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na <= f32::EPSILON || nb <= f32::EPSILON {
        return 0.0;
    }
    dot / (na * nb)
}

// ─── HTTP implementation ────────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// OpenAI-compatible `/embeddings` client.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    settings: EmbeddingSettings,
}

impl HttpEmbeddingClient {
    pub fn new(settings: EmbeddingSettings) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::infra(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpEmbeddingClient { http, settings })
    }

    async fn request(&self, input: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.settings.base_url);
        let body = EmbeddingRequest {
            model: &self.settings.model,
            input,
        };

        let mut request = self.http.post(&url).json(&body);
        if let Some(ref key) = self.settings.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| CoreError::Model {
            reason: format!("embedding request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Model {
                reason: format!("embedding backend HTTP {status}: {body}"),
            });
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| CoreError::Model {
            reason: format!("embedding response parse failed: {e}"),
        })?;

        let mut vectors = Vec::with_capacity(parsed.data.len());
        for datum in parsed.data {
            let mut v = datum.embedding;
            if v.len() != self.settings.dimensions {
                return Err(CoreError::Model {
                    reason: format!(
                        "embedding dimension mismatch: got {}, expected {}",
                        v.len(),
                        self.settings.dimensions
                    ),
                });
            }
            l2_normalize(&mut v);
            vectors.push(v);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    fn dimensions(&self) -> usize {
        self.settings.dimensions
    }

    async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let input = [text.to_string()];
        let mut vectors = self.request(&input).await?;
        vectors
            .pop()
            .ok_or_else(|| CoreError::Model {
                reason: "embedding backend returned no vectors".into(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn test_normalize_to_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((norm(&v) - 1.0).abs() < 1e-3);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector_untouched() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_mean_of_identical_vectors_is_that_vector() {
        let mut base = vec![0.2, 0.5, 0.8];
        l2_normalize(&mut base);
        let mean = mean_unit_vector(&[base.clone(), base.clone(), base.clone()]).unwrap();
        for (a, b) in mean.iter().zip(base.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!((norm(&mean) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_mean_vector_unit_norm() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        let mean = mean_unit_vector(&[a, b]).unwrap();
        assert!((norm(&mean) - 1.0).abs() < 1e-3);
        assert!((mean[0] - mean[1]).abs() < 1e-6);
    }

    #[test]
    fn test_mean_of_empty_is_none() {
        assert!(mean_unit_vector(&[]).is_none());
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![-1.0, 0.0];
        let d = vec![0.0, 1.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&a, &c) + 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &d).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[]), 0.0);
    }
}
