//! Vector store abstraction, REST client, and in-memory implementation.
//!
//! The [`VectorStore`] trait covers the five operations the service needs:
//! collection lifecycle, batched upsert, similarity search, payload scroll,
//! and stats. [`QdrantStore`] talks to a Qdrant-compatible REST API;
//! [`MemoryVectorStore`] is a brute-force cosine store for tests and
//! offline runs.
//!
//! Collections are created with cosine distance. When two hits tie on
//! score the store's native ordering is preserved; callers must not rely
//! on a particular tie order here (the retrieval layer applies its own
//! deterministic tie-breaking).

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::VectorStoreConfig;
use crate::error::{classify_http_error, Error, Result};
use crate::models::{Payload, ScoredPoint, VectorPoint};

/// Points per upsert request.
const UPSERT_BATCH: usize = 100;
/// Retries per upsert/search request.
const REQUEST_RETRIES: u32 = 3;
/// Exponential backoff base for retried requests.
const RETRY_BASE: Duration = Duration::from_secs(1);

/// Collection statistics.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub points_count: u64,
    pub dimension: usize,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent: creates the collection with cosine distance if absent,
    /// validates the dimension of an existing one.
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()>;

    /// Idempotent: deleting a missing collection succeeds.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// True if the collection exists.
    async fn collection_exists(&self, name: &str) -> Result<bool>;

    /// Upsert points in batches; each batch is atomic from the caller's
    /// view and retried with exponential backoff.
    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()>;

    /// Hits ordered by descending similarity.
    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>>;

    /// Forward-only payload enumeration. Pass the returned offset token to
    /// continue; `None` means exhausted. Vectors are not returned.
    async fn scroll(
        &self,
        name: &str,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<VectorPoint>, Option<String>)>;

    /// Remove every point uploaded for one file.
    async fn delete_by_file(&self, name: &str, file_id: &str) -> Result<()>;

    async fn count(&self, name: &str) -> Result<u64>;

    async fn info(&self, name: &str) -> Result<CollectionInfo>;

    /// Probe reachability. Never fails; reports false instead.
    async fn check_available(&self) -> bool;
}

/// Scroll every payload out of a collection.
pub async fn scroll_all(
    store: &dyn VectorStore,
    name: &str,
    page_size: usize,
) -> Result<Vec<VectorPoint>> {
    let mut out = Vec::new();
    let mut offset = None;
    loop {
        let (points, next) = store.scroll(name, offset, page_size).await?;
        out.extend(points);
        match next {
            Some(token) => offset = Some(token),
            None => break,
        }
    }
    Ok(out)
}

// ============ Qdrant REST client ============

/// Client for a Qdrant-compatible vector store REST API.
pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST a JSON body with retry on transport errors and 5xx responses.
    async fn request_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<serde_json::Value> {
        let mut last_err = None;

        for attempt in 0..=REQUEST_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt - 1)).await;
            }

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| Error::VectorStore(format!("invalid response: {e}")));
                    }
                    let body = response.text().await.unwrap_or_default();
                    if status.is_server_error() {
                        last_err = Some(Error::VectorStore(format!(
                            "vector store error {status}: {body}"
                        )));
                        continue;
                    }
                    return Err(Error::VectorStore(format!(
                        "vector store error {status}: {body}"
                    )));
                }
                Err(e) => {
                    last_err = Some(classify_http_error(&e, "vector store"));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| Error::VectorStore("request failed after retries".to_string())))
    }

    async fn fetch_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let resp = self
            .client
            .get(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .map_err(|e| classify_http_error(&e, "vector store"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::VectorStore(format!(
                "vector store error {status}: {body}"
            )));
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::VectorStore(format!("invalid response: {e}")))?;
        let result = &json["result"];
        let dimension = result["config"]["params"]["vectors"]["size"]
            .as_u64()
            .unwrap_or(0) as usize;
        let points_count = result["points_count"].as_u64().unwrap_or(0);

        Ok(Some(CollectionInfo {
            points_count,
            dimension,
        }))
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        if let Some(existing) = self.fetch_info(name).await? {
            if existing.dimension != dim {
                return Err(Error::VectorStore(format!(
                    "collection '{name}' has dimension {}, expected {dim}",
                    existing.dimension
                )));
            }
            return Ok(());
        }

        let body = serde_json::json!({
            "vectors": { "size": dim, "distance": "Cosine" }
        });
        self.request_with_retry(|| {
            self.client
                .put(self.url(&format!("/collections/{name}")))
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/collections/{name}")))
            .send()
            .await
            .map_err(|e| classify_http_error(&e, "vector store"))?;

        // Missing collections delete cleanly.
        if resp.status().is_success() || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(Error::VectorStore(format!(
            "vector store error {status}: {body}"
        )))
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.fetch_info(name).await?.is_some())
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        for batch in points.chunks(UPSERT_BATCH) {
            let body = serde_json::json!({
                "points": batch.iter().map(|p| serde_json::json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": p.payload,
                })).collect::<Vec<_>>()
            });
            self.request_with_retry(|| {
                self.client
                    .put(self.url(&format!("/collections/{name}/points?wait=true")))
                    .json(&body)
            })
            .await?;
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = serde_json::json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(threshold) = score_threshold {
            body["score_threshold"] = serde_json::json!(threshold);
        }

        let json = self
            .request_with_retry(|| {
                self.client
                    .post(self.url(&format!("/collections/{name}/points/search")))
                    .json(&body)
            })
            .await?;

        let hits = json["result"]
            .as_array()
            .ok_or_else(|| Error::VectorStore("search response missing result".to_string()))?;

        hits.iter()
            .map(|hit| {
                let payload: Payload = serde_json::from_value(hit["payload"].clone())
                    .map_err(|e| Error::VectorStore(format!("malformed payload: {e}")))?;
                Ok(ScoredPoint {
                    id: point_id_string(&hit["id"]),
                    score: hit["score"].as_f64().unwrap_or(0.0) as f32,
                    payload,
                })
            })
            .collect()
    }

    async fn scroll(
        &self,
        name: &str,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<VectorPoint>, Option<String>)> {
        let mut body = serde_json::json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": false,
        });
        if let Some(offset) = &offset {
            body["offset"] = serde_json::json!(offset);
        }

        let json = self
            .request_with_retry(|| {
                self.client
                    .post(self.url(&format!("/collections/{name}/points/scroll")))
                    .json(&body)
            })
            .await?;

        let result = &json["result"];
        let points = result["points"]
            .as_array()
            .ok_or_else(|| Error::VectorStore("scroll response missing points".to_string()))?
            .iter()
            .map(|p| {
                let payload: Payload = serde_json::from_value(p["payload"].clone())
                    .map_err(|e| Error::VectorStore(format!("malformed payload: {e}")))?;
                Ok(VectorPoint {
                    id: point_id_string(&p["id"]),
                    vector: Vec::new(),
                    payload,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let next = result["next_page_offset"]
            .as_str()
            .map(|s| s.to_string())
            .or_else(|| result["next_page_offset"].as_u64().map(|n| n.to_string()));

        Ok((points, next))
    }

    async fn delete_by_file(&self, name: &str, file_id: &str) -> Result<()> {
        let body = serde_json::json!({
            "filter": {
                "must": [{"key": "file_id", "match": {"value": file_id}}]
            }
        });
        self.request_with_retry(|| {
            self.client
                .post(self.url(&format!("/collections/{name}/points/delete?wait=true")))
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn count(&self, name: &str) -> Result<u64> {
        let json = self
            .request_with_retry(|| {
                self.client
                    .post(self.url(&format!("/collections/{name}/points/count")))
                    .json(&serde_json::json!({"exact": true}))
            })
            .await?;
        Ok(json["result"]["count"].as_u64().unwrap_or(0))
    }

    async fn info(&self, name: &str) -> Result<CollectionInfo> {
        self.fetch_info(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))
    }

    async fn check_available(&self) -> bool {
        match self.client.get(self.url("/collections")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Qdrant point ids may come back as strings or integers.
fn point_id_string(id: &serde_json::Value) -> String {
    id.as_str()
        .map(|s| s.to_string())
        .unwrap_or_else(|| id.to_string())
}

// ============ In-memory store ============

struct MemoryCollection {
    dim: usize,
    points: Vec<VectorPoint>,
}

/// Brute-force cosine store backed by a map. Search and scroll share the
/// trait contract with the REST client, so higher layers are exercised
/// against it in tests.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, MemoryCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn ensure_collection(&self, name: &str, dim: usize) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        match collections.get(name) {
            Some(existing) if existing.dim != dim => Err(Error::VectorStore(format!(
                "collection '{name}' has dimension {}, expected {dim}",
                existing.dim
            ))),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    name.to_string(),
                    MemoryCollection {
                        dim,
                        points: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.write().unwrap().remove(name);
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.collections.read().unwrap().contains_key(name))
    }

    async fn upsert(&self, name: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;
        for point in points {
            if point.vector.len() != collection.dim {
                return Err(Error::VectorStore(format!(
                    "point dimension {} does not match collection dimension {}",
                    point.vector.len(),
                    collection.dim
                )));
            }
            match collection.points.iter_mut().find(|p| p.id == point.id) {
                Some(existing) => *existing = point,
                None => collection.points.push(point),
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<ScoredPoint>> {
        let collections = self.collections.read().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;

        let mut hits: Vec<ScoredPoint> = collection
            .points
            .iter()
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .filter(|h| score_threshold.map(|t| h.score >= t).unwrap_or(true))
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn scroll(
        &self,
        name: &str,
        offset: Option<String>,
        limit: usize,
    ) -> Result<(Vec<VectorPoint>, Option<String>)> {
        let collections = self.collections.read().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;

        let start: usize = offset
            .as_deref()
            .map(|s| s.parse().unwrap_or(0))
            .unwrap_or(0);
        let end = (start + limit).min(collection.points.len());
        let page: Vec<VectorPoint> = collection.points[start..end]
            .iter()
            .map(|p| VectorPoint {
                id: p.id.clone(),
                vector: Vec::new(),
                payload: p.payload.clone(),
            })
            .collect();

        let next = if end < collection.points.len() {
            Some(end.to_string())
        } else {
            None
        };
        Ok((page, next))
    }

    async fn delete_by_file(&self, name: &str, file_id: &str) -> Result<()> {
        let mut collections = self.collections.write().unwrap();
        let collection = collections
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;
        collection.points.retain(|p| p.payload.file_id != file_id);
        Ok(())
    }

    async fn count(&self, name: &str) -> Result<u64> {
        let collections = self.collections.read().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;
        Ok(collection.points.len() as u64)
    }

    async fn info(&self, name: &str) -> Result<CollectionInfo> {
        let collections = self.collections.read().unwrap();
        let collection = collections
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("collection '{name}'")))?;
        Ok(CollectionInfo {
            points_count: collection.points.len() as u64,
            dimension: collection.dim,
        })
    }

    async fn check_available(&self) -> bool {
        true
    }
}

/// Cosine similarity between two vectors. Returns 0.0 for empty or
/// mismatched inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
