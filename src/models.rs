//! Core data types flowing through the ingestion and retrieval pipeline.
//!
//! A loaded file becomes one or more [`Document`]s, the chunker cuts those
//! into [`Chunk`]s, the embedder turns chunks into [`VectorPoint`]s, and
//! retrieval returns [`SearchHit`]s. Knowledge-base and file records are the
//! persistent entities owned by the metadata store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of text produced by a loader, before chunking.
///
/// `metadata` always carries `source` (the originating file path) and may
/// carry loader-specific keys such as `page` for PDFs.
#[derive(Debug, Clone)]
pub struct Document {
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(content: impl Into<String>, source: &str) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("source".to_string(), serde_json::json!(source));
        Self {
            content: content.into(),
            metadata,
        }
    }

    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

/// A bounded text fragment produced by the chunker. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    /// Originating file path, copied from the parent document.
    pub source: String,
    /// Monotone within one source.
    pub chunk_index: i64,
    /// Loader metadata inherited from the parent document.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Payload stored alongside each vector in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub text: String,
    pub source: String,
    pub file_id: String,
    pub kb_id: String,
    pub chunk_index: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A single point in a vector collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: Payload,
}

/// A hit returned by the vector store's similarity search.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: Payload,
}

/// Chunking parameters, configurable per knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub respect_sentence_boundary: bool,
    pub chinese_aware: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            respect_sentence_boundary: true,
            chinese_aware: false,
        }
    }
}

impl ChunkConfig {
    /// Overlap must leave room for fresh content in every chunk.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.chunk_size == 0 {
            return Err(crate::error::Error::Validation(
                "chunk_size must be > 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(crate::error::Error::Validation(format!(
                "chunk_overlap ({}) must be < chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Search strategy selected per knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Vector,
    Fulltext,
    Hybrid,
}

/// Retrieval tuning, configurable per knowledge base and overridable per
/// query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    pub mode: RetrievalMode,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub adaptive_min_threshold: f32,
    pub adaptive_target_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: RetrievalMode::Hybrid,
            top_k: 5,
            similarity_threshold: 0.3,
            vector_weight: 0.7,
            keyword_weight: 0.3,
            adaptive_min_threshold: 0.2,
            adaptive_target_results: 3,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        for (name, v) in [
            ("similarity_threshold", self.similarity_threshold),
            ("adaptive_min_threshold", self.adaptive_min_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(crate::error::Error::Validation(format!(
                    "{name} must be in [0, 1], got {v}"
                )));
            }
        }
        if self.top_k == 0 {
            return Err(crate::error::Error::Validation(
                "top_k must be >= 1".to_string(),
            ));
        }
        let sum = self.vector_weight + self.keyword_weight;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(crate::error::Error::Validation(format!(
                "vector_weight + keyword_weight must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

/// A named, isolated corpus with its own vector collection and configuration.
///
/// `embedding_model` and `embedding_dimension` are fixed for the KB's
/// lifetime; the manager rejects patches that touch them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBase {
    pub id: String,
    pub name: String,
    pub description: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chunk_config: ChunkConfig,
    pub retrieval_config: RetrievalConfig,
    pub collection_name: String,
    pub document_count: i64,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derive the vector-store collection name from a KB id. Hyphens are
/// stripped so the name stays a plain identifier.
pub fn collection_name_for(kb_id: &str) -> String {
    format!("kb_{}", kb_id.replace('-', ""))
}

/// Validate a knowledge-base name: 2..=100 chars, alphanumeric (any
/// script) plus `_` and `-`.
pub fn validate_kb_name(name: &str) -> crate::error::Result<()> {
    let len = name.chars().count();
    if !(2..=100).contains(&len) {
        return Err(crate::error::Error::Validation(format!(
            "name must be 2..=100 characters, got {len}"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(crate::error::Error::Validation(format!(
            "name contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Lifecycle state of an uploaded file.
///
/// `pending → parsing → persisting → succeeded | failed`. A failed or
/// cancelled file is reattempted by delete + re-upload, never resurrected
/// in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Parsing,
    Persisting,
    Succeeded,
    Failed,
    Cancelled,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Parsing => "parsing",
            FileStatus::Persisting => "persisting",
            FileStatus::Succeeded => "succeeded",
            FileStatus::Failed => "failed",
            FileStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FileStatus::Pending),
            "parsing" => Some(FileStatus::Parsing),
            "persisting" => Some(FileStatus::Persisting),
            "succeeded" => Some(FileStatus::Succeeded),
            "failed" => Some(FileStatus::Failed),
            "cancelled" => Some(FileStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Pending, Parsing)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Parsing, Persisting)
                | (Parsing, Failed)
                | (Parsing, Cancelled)
                | (Persisting, Succeeded)
                | (Persisting, Failed)
        )
    }
}

/// A file uploaded into one knowledge base.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntity {
    pub id: String,
    pub kb_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub status: FileStatus,
    /// 0 until the file reaches `succeeded`.
    pub chunk_count: i64,
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A retrieval result handed to callers and to the agent's tool loop.
///
/// Sorted by descending score; ties break on lower `chunk_index`, then
/// lower `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub score: f32,
    pub content: String,
    pub source: String,
    pub chunk_index: i64,
    pub id: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_config_rejects_overlap_ge_size() {
        let cfg = ChunkConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ChunkConfig {
            chunk_size: 100,
            chunk_overlap: 99,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn retrieval_config_weights_must_sum_to_one() {
        let mut cfg = RetrievalConfig::default();
        cfg.vector_weight = 0.5;
        cfg.keyword_weight = 0.4;
        assert!(cfg.validate().is_err());

        cfg.keyword_weight = 0.5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn kb_name_validation() {
        assert!(validate_kb_name("a").is_err());
        assert!(validate_kb_name("my-kb_01").is_ok());
        assert!(validate_kb_name("知识库").is_ok());
        assert!(validate_kb_name("bad name").is_err());
        assert!(validate_kb_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn file_status_lifecycle() {
        use FileStatus::*;
        assert!(Pending.can_transition_to(Parsing));
        assert!(Parsing.can_transition_to(Persisting));
        assert!(Persisting.can_transition_to(Succeeded));
        assert!(Parsing.can_transition_to(Failed));
        assert!(!Succeeded.can_transition_to(Parsing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Parsing));
    }

    #[test]
    fn collection_name_strips_hyphens() {
        let name = collection_name_for("123e4567-e89b-12d3-a456-426614174000");
        assert_eq!(name, "kb_123e4567e89b12d3a456426614174000");
    }

    #[test]
    fn file_status_roundtrip() {
        for s in [
            FileStatus::Pending,
            FileStatus::Parsing,
            FileStatus::Persisting,
            FileStatus::Succeeded,
            FileStatus::Failed,
            FileStatus::Cancelled,
        ] {
            assert_eq!(FileStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(FileStatus::parse("unknown"), None);
    }
}
