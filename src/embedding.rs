//! Embedding client abstraction and the Ollama-backed implementation.
//!
//! The [`Embedder`] trait is the seam between the pipeline and the external
//! embedding service; tests substitute deterministic in-process embedders.
//!
//! # Retry strategy
//!
//! Document batches are embedded `batch_size` texts at a time. Each batch
//! call is retried with multiplicative backoff (initial 1.5s, factor 1.5,
//! capped) on transport errors, timeouts, HTTP 429 and 5xx. Other client
//! errors fail immediately. A batch of more than one text that exhausts its
//! retries falls back to per-item embedding to isolate the offending text;
//! an item that still fails aborts the call with the first error preserved.
//!
//! A vector of unexpected dimensionality is a configuration fault, not a
//! transient condition: it fails immediately and is never retried.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{classify_http_error, Error, Result};

/// Upper bound on any single backoff sleep.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Produces fixed-dimension vectors for texts.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;
    fn dimension(&self) -> usize;

    /// Embed a single query text.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of documents, preserving input order. Returns exactly
    /// `texts.len()` vectors or fails.
    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Probe service and model presence. Never fails; reports false instead.
    async fn check_available(&self) -> bool;
}

/// Embedding client for an Ollama-compatible `/api/embed` endpoint.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    host: String,
    model: String,
    dim: usize,
    batch_size: usize,
    retries: u32,
    backoff_initial: Duration,
    backoff_factor: f64,
    inter_batch_delay: Duration,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;

        Ok(Self {
            client,
            host: config.host.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dim: config.dim,
            batch_size: config.batch_size.max(1),
            retries: config.retries,
            backoff_initial: Duration::from_secs_f64(config.backoff_initial_s.max(0.0)),
            backoff_factor: config.backoff_factor.max(1.0),
            inter_batch_delay: Duration::from_secs_f64(config.inter_batch_delay_s.max(0.0)),
        })
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self.backoff_initial.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(secs).min(BACKOFF_CAP)
    }

    /// One batch against the service, with retries. Dimension mismatches
    /// abort immediately.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(attempt - 1)).await;
            }

            let resp = self
                .client
                .post(format!("{}/api/embed", self.host))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| Error::Embedding(format!("invalid response: {e}")))?;
                        let vectors = parse_embed_response(&json)?;
                        return validate_dimensions(vectors, texts.len(), self.dim);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(Error::Embedding(format!(
                            "embedding service error {status}: {body_text}"
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(Error::Embedding(format!(
                        "embedding service error {status}: {body_text}"
                    )));
                }
                Err(e) => {
                    last_err = Some(classify_http_error(&e, "embedding"));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::Embedding("embedding failed after retries".to_string())))
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embedding response".to_string()))
    }

    async fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());

        for (i, batch) in texts.chunks(self.batch_size).enumerate() {
            if i > 0 && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }

            match self.embed_batch(batch).await {
                Ok(vectors) => out.extend(vectors),
                Err(first_err) => {
                    // Dimension mismatches are configuration faults; no
                    // amount of isolation helps.
                    if batch.len() <= 1 || is_dimension_mismatch(&first_err) {
                        return Err(first_err);
                    }
                    tracing::warn!(
                        batch = i,
                        error = %first_err,
                        "batch embedding failed, falling back to per-item"
                    );
                    for text in batch {
                        match self.embed_batch(std::slice::from_ref(text)).await {
                            Ok(mut vectors) => out.append(&mut vectors),
                            Err(_) => return Err(first_err),
                        }
                    }
                }
            }
        }

        Ok(out)
    }

    async fn check_available(&self) -> bool {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()
            .await;

        let Ok(response) = resp else { return false };
        if !response.status().is_success() {
            return false;
        }
        let Ok(json) = response.json::<serde_json::Value>().await else {
            return false;
        };

        json.get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models.iter().any(|m| {
                    m.get("name")
                        .and_then(|n| n.as_str())
                        .map(|n| n == self.model || n.trim_end_matches(":latest") == self.model)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }
}

fn is_dimension_mismatch(err: &Error) -> bool {
    matches!(err, Error::Embedding(msg) if msg.contains("dimension"))
}

/// Extract the `embeddings` array from an `/api/embed` response.
fn parse_embed_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| Error::Embedding("response missing embeddings array".to_string()))?;

    let mut result = Vec::with_capacity(embeddings.len());
    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| Error::Embedding("embedding is not an array".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }
    Ok(result)
}

fn validate_dimensions(
    vectors: Vec<Vec<f32>>,
    expected_count: usize,
    expected_dim: usize,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected_count {
        return Err(Error::Embedding(format!(
            "expected {expected_count} vectors, got {}",
            vectors.len()
        )));
    }
    for v in &vectors {
        if v.len() != expected_dim {
            return Err(Error::Embedding(format!(
                "dimension mismatch: expected {expected_dim}, got {}",
                v.len()
            )));
        }
    }
    Ok(vectors)
}
