//! Configuration parsing and validation.
//!
//! The service is configured via a TOML file (default: `config/ragserve.toml`).
//! The config defines the metadata database path, the external LLM and
//! embedding endpoints, the vector store URL, default chunking and retrieval
//! parameters (new knowledge bases inherit them), operational limits, and the
//! flow log destination.
//!
//! Every recognized key is validated on startup by [`load_config`]: URLs must
//! parse, positive integers must be positive, thresholds must lie in `[0, 1]`,
//! `chunk_overlap < chunk_size`, and the hybrid weights must sum to 1.0.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::{ChunkConfig, RetrievalConfig, RetrievalMode};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalDefaults,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub flow_log: FlowLogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Base URL of the LLM service (e.g. `http://localhost:11434`).
    pub host: String,
    pub model: String,
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
}

fn default_llm_timeout_s() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service.
    pub host: String,
    pub model: String,
    /// Expected output dimension; every returned vector is checked against it.
    pub dim: usize,
    #[serde(default = "default_embed_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff_initial_s")]
    pub backoff_initial_s: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default)]
    pub inter_batch_delay_s: f64,
    #[serde(default = "default_embed_timeout_s")]
    pub timeout_s: u64,
}

fn default_embed_batch_size() -> usize {
    16
}
fn default_embed_retries() -> u32 {
    5
}
fn default_backoff_initial_s() -> f64 {
    1.5
}
fn default_backoff_factor() -> f64 {
    1.5
}
fn default_embed_timeout_s() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorStoreConfig {
    /// Base URL of the vector store REST API.
    pub url: String,
    /// Recognized for compatibility; KB collections are derived from KB
    /// ids, so this only names the fallback collection.
    #[serde(default = "default_collection")]
    #[allow(dead_code)]
    pub default_collection: String,
    #[serde(default = "default_vector_timeout_s")]
    pub timeout_s: u64,
}

fn default_collection() -> String {
    "documents".to_string()
}
fn default_vector_timeout_s() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_true")]
    pub respect_sentence_boundary: bool,
    #[serde(default)]
    pub chinese_aware: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            respect_sentence_boundary: true,
            chinese_aware: false,
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_true() -> bool {
    true
}

impl ChunkingConfig {
    pub fn to_chunk_config(&self) -> ChunkConfig {
        ChunkConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            respect_sentence_boundary: self.respect_sentence_boundary,
            chinese_aware: self.chinese_aware,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalDefaults {
    #[serde(default = "default_mode")]
    pub mode: RetrievalMode,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
    #[serde(default = "default_adaptive_min_threshold")]
    pub adaptive_min_threshold: f32,
    #[serde(default = "default_adaptive_target_results")]
    pub adaptive_target_results: usize,
}

impl Default for RetrievalDefaults {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            vector_weight: default_vector_weight(),
            keyword_weight: default_keyword_weight(),
            adaptive_min_threshold: default_adaptive_min_threshold(),
            adaptive_target_results: default_adaptive_target_results(),
        }
    }
}

fn default_mode() -> RetrievalMode {
    RetrievalMode::Hybrid
}
fn default_top_k() -> usize {
    5
}
fn default_similarity_threshold() -> f32 {
    0.3
}
fn default_vector_weight() -> f32 {
    0.7
}
fn default_keyword_weight() -> f32 {
    0.3
}
fn default_adaptive_min_threshold() -> f32 {
    0.2
}
fn default_adaptive_target_results() -> usize {
    3
}

impl RetrievalDefaults {
    pub fn to_retrieval_config(&self) -> RetrievalConfig {
        RetrievalConfig {
            mode: self.mode,
            top_k: self.top_k,
            similarity_threshold: self.similarity_threshold,
            vector_weight: self.vector_weight,
            keyword_weight: self.keyword_weight,
            adaptive_min_threshold: self.adaptive_min_threshold,
            adaptive_target_results: self.adaptive_target_results,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_ingest_worker_pool")]
    pub ingest_worker_pool: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_query_length: default_max_query_length(),
            max_file_size_bytes: default_max_file_size_bytes(),
            ingest_worker_pool: default_ingest_worker_pool(),
        }
    }
}

fn default_max_query_length() -> usize {
    2000
}
fn default_max_file_size_bytes() -> u64 {
    100 * 1024 * 1024
}
fn default_ingest_worker_pool() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct FlowLogConfig {
    #[serde(default = "default_flow_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_detail_level")]
    pub detail_level: String,
}

impl Default for FlowLogConfig {
    fn default() -> Self {
        Self {
            path: default_flow_log_path(),
            detail_level: default_detail_level(),
        }
    }
}

fn default_flow_log_path() -> PathBuf {
    PathBuf::from("data/flow.log")
}
fn default_detail_level() -> String {
    "normal".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    for (name, url) in [
        ("llm.host", &config.llm.host),
        ("embedding.host", &config.embedding.host),
        ("vector_store.url", &config.vector_store.url),
    ] {
        reqwest::Url::parse(url).with_context(|| format!("{name} is not a valid URL: {url}"))?;
    }

    if config.embedding.dim == 0 {
        anyhow::bail!("embedding.dim must be > 0");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.backoff_factor < 1.0 {
        anyhow::bail!("embedding.backoff_factor must be >= 1.0");
    }
    if config.embedding.inter_batch_delay_s < 0.0 {
        anyhow::bail!("embedding.inter_batch_delay_s must be >= 0");
    }

    config
        .chunking
        .to_chunk_config()
        .validate()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    config
        .retrieval
        .to_retrieval_config()
        .validate()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    if config.limits.max_query_length == 0 {
        anyhow::bail!("limits.max_query_length must be > 0");
    }
    if config.limits.ingest_worker_pool == 0 {
        anyhow::bail!("limits.ingest_worker_pool must be > 0");
    }

    match config.flow_log.detail_level.as_str() {
        "minimal" | "normal" | "verbose" => {}
        other => anyhow::bail!(
            "flow_log.detail_level must be minimal, normal, or verbose (got '{other}')"
        ),
    }

    Ok(())
}
