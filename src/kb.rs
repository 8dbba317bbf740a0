//! Knowledge-base manager: lifecycle, uploads, and query dispatch.
//!
//! Composes the metadata store, the vector store, the ingestion pipeline,
//! and the retrieval engine. Lifecycle ordering is deliberate:
//!
//! - **create**: record first, then collection; a failed collection create
//!   rolls the record back, so no record ever points at a missing
//!   collection.
//! - **delete**: collection first, then record (cascading files); a crash
//!   between the steps leaves at most an orphan collection, never an
//!   orphan record.
//!
//! `embedding_model` and `embedding_dimension` are immutable after
//! creation; patches touching them are rejected.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::agent::KnowledgeSearch;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::ingest::{IngestionPipeline, IngestionReport};
use crate::metadata::MetadataStore;
use crate::models::{
    collection_name_for, validate_kb_name, ChunkConfig, FileEntity, FileStatus, KnowledgeBase,
    RetrievalConfig, RetrievalMode, SearchHit, MAX_DESCRIPTION_LEN,
};
use crate::retrieval::{expand_query, RetrievalEngine};
use crate::vectorstore::VectorStore;

/// Creation request. Omitted fields inherit the configured defaults.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct KbSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
    pub chunk_config: Option<ChunkConfig>,
    pub retrieval_config: Option<RetrievalConfig>,
}

/// Update request. `embedding_model` / `embedding_dimension` are present
/// only so an attempt to change them can be rejected explicitly.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct KbPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub chunk_config: Option<ChunkConfig>,
    pub retrieval_config: Option<RetrievalConfig>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
}

/// Per-query retrieval overrides.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct QueryOverrides {
    pub mode: Option<RetrievalMode>,
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f32>,
}

/// Defaults a new KB inherits when its spec leaves fields out.
#[derive(Debug, Clone)]
pub struct KbDefaults {
    pub embedding_model: String,
    pub embedding_dimension: usize,
    pub chunk_config: ChunkConfig,
    pub retrieval_config: RetrievalConfig,
}

pub struct KbManager {
    metadata: MetadataStore,
    store: Arc<dyn VectorStore>,
    pipeline: IngestionPipeline,
    engine: RetrievalEngine,
    defaults: KbDefaults,
    uploads_dir: PathBuf,
    /// Caller-supplied synonym dictionary for query expansion; empty by
    /// default.
    synonyms: HashMap<String, Vec<String>>,
}

impl KbManager {
    pub fn new(
        metadata: MetadataStore,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        pipeline: IngestionPipeline,
        defaults: KbDefaults,
        uploads_dir: PathBuf,
    ) -> Self {
        let engine = RetrievalEngine::new(embedder, Arc::clone(&store));
        Self {
            metadata,
            store,
            pipeline,
            engine,
            defaults,
            uploads_dir,
            synonyms: HashMap::new(),
        }
    }

    pub fn with_synonyms(mut self, synonyms: HashMap<String, Vec<String>>) -> Self {
        self.synonyms = synonyms;
        self
    }

    // ============ Lifecycle ============

    pub async fn create_kb(&self, spec: KbSpec) -> Result<KnowledgeBase> {
        validate_kb_name(&spec.name)?;
        if spec.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(Error::Validation(format!(
                "description exceeds {MAX_DESCRIPTION_LEN} characters"
            )));
        }

        let chunk_config = spec.chunk_config.unwrap_or_else(|| self.defaults.chunk_config.clone());
        chunk_config.validate()?;
        let retrieval_config = spec
            .retrieval_config
            .unwrap_or_else(|| self.defaults.retrieval_config.clone());
        retrieval_config.validate()?;

        let embedding_dimension = spec
            .embedding_dimension
            .unwrap_or(self.defaults.embedding_dimension);
        if embedding_dimension == 0 {
            return Err(Error::Validation(
                "embedding_dimension must be > 0".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let kb = KnowledgeBase {
            collection_name: collection_name_for(&id),
            id,
            name: spec.name,
            description: spec.description,
            embedding_model: spec
                .embedding_model
                .unwrap_or_else(|| self.defaults.embedding_model.clone()),
            embedding_dimension,
            chunk_config,
            retrieval_config,
            document_count: 0,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        };

        self.metadata.create_kb(&kb).await?;

        if let Err(e) = self
            .store
            .ensure_collection(&kb.collection_name, kb.embedding_dimension)
            .await
        {
            // Roll the record back so no KB points at a missing collection.
            if let Err(rollback) = self.metadata.delete_kb(&kb.id).await {
                tracing::error!(kb_id = %kb.id, error = %rollback, "rollback failed");
            }
            return Err(e);
        }

        tracing::info!(kb_id = %kb.id, name = %kb.name, "knowledge base created");
        Ok(kb)
    }

    pub async fn get_kb(&self, id: &str) -> Result<KnowledgeBase> {
        self.metadata.get_kb(id).await
    }

    pub async fn list_kbs(&self, page: u32, size: u32) -> Result<(Vec<KnowledgeBase>, u64)> {
        self.metadata.list_kbs(page, size).await
    }

    pub async fn update_kb(&self, id: &str, patch: KbPatch) -> Result<KnowledgeBase> {
        if patch.embedding_model.is_some() || patch.embedding_dimension.is_some() {
            return Err(Error::Conflict(
                "embedding_model and embedding_dimension are fixed for the lifetime \
                 of a knowledge base"
                    .to_string(),
            ));
        }

        let mut kb = self.metadata.get_kb(id).await?;
        if let Some(name) = patch.name {
            validate_kb_name(&name)?;
            kb.name = name;
        }
        if let Some(description) = patch.description {
            if description.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(Error::Validation(format!(
                    "description exceeds {MAX_DESCRIPTION_LEN} characters"
                )));
            }
            kb.description = description;
        }
        if let Some(chunk_config) = patch.chunk_config {
            chunk_config.validate()?;
            kb.chunk_config = chunk_config;
        }
        if let Some(retrieval_config) = patch.retrieval_config {
            retrieval_config.validate()?;
            kb.retrieval_config = retrieval_config;
        }

        self.metadata.update_kb(&kb).await?;
        self.metadata.get_kb(id).await
    }

    pub async fn delete_kb(&self, id: &str) -> Result<()> {
        let kb = self.metadata.get_kb(id).await?;
        self.store.delete_collection(&kb.collection_name).await?;
        self.metadata.delete_kb(id).await?;
        tracing::info!(kb_id = %id, "knowledge base deleted");
        Ok(())
    }

    // ============ Files ============

    /// Persist an uploaded file under the uploads directory, register it,
    /// and process it immediately.
    pub async fn upload_file(
        &self,
        kb_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<FileEntity> {
        let kb = self.metadata.get_kb(kb_id).await?;

        let file_id = Uuid::new_v4().to_string();
        let dir = self.uploads_dir.join(kb_id);
        std::fs::create_dir_all(&dir)?;
        let safe_name = file_name.replace(['/', '\\'], "_");
        let path = dir.join(format!("{file_id}_{safe_name}"));
        std::fs::write(&path, bytes)?;

        let now = Utc::now();
        let entity = FileEntity {
            id: file_id,
            kb_id: kb_id.to_string(),
            file_name: safe_name,
            file_path: path.display().to_string(),
            file_size: bytes.len() as i64,
            content_type: content_type_of(file_name),
            status: FileStatus::Pending,
            chunk_count: 0,
            failed_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.metadata.add_file(&entity).await?;

        let summary = self.pipeline.ingest_file_entity(&kb, &entity).await?;
        if let Some(error) = &summary.error {
            tracing::warn!(file = %entity.file_name, error, "upload processing failed");
        }

        self.metadata.get_file(kb_id, &entity.id).await
    }

    pub async fn list_files(
        &self,
        kb_id: &str,
        status: Option<FileStatus>,
        name_query: Option<&str>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<FileEntity>, u64)> {
        self.metadata.get_kb(kb_id).await?;
        self.metadata
            .list_files(kb_id, status, name_query, page, size)
            .await
    }

    /// Remove a file's record and its vectors. Re-ingesting a failed file
    /// is exactly this followed by a fresh upload.
    pub async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<()> {
        let kb = self.metadata.get_kb(kb_id).await?;
        let file = self.metadata.get_file(kb_id, file_id).await?;

        if file.chunk_count > 0 {
            self.store
                .delete_by_file(&kb.collection_name, file_id)
                .await?;
        }
        self.metadata.delete_file(kb_id, file_id).await?;
        Ok(())
    }

    // ============ Ingestion & query ============

    pub async fn ingest_paths(
        &self,
        kb_id: &str,
        paths: &[PathBuf],
        force: bool,
    ) -> Result<IngestionReport> {
        let kb = self.metadata.get_kb(kb_id).await?;
        self.pipeline.ingest(&kb, paths, force).await
    }

    /// Search one KB with its effective retrieval configuration merged with
    /// per-request overrides.
    pub async fn query(
        &self,
        kb_id: &str,
        query: &str,
        overrides: &QueryOverrides,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".to_string()));
        }

        let kb = self.metadata.get_kb(kb_id).await?;
        let mut config = kb.retrieval_config.clone();
        if let Some(mode) = overrides.mode {
            config.mode = mode;
        }
        if let Some(top_k) = overrides.top_k {
            config.top_k = top_k;
        }
        if let Some(threshold) = overrides.similarity_threshold {
            config.similarity_threshold = threshold;
        }
        config.validate()?;

        let expanded = expand_query(query, &self.synonyms, 3);
        self.engine
            .search(&kb.collection_name, &expanded, &config)
            .await
    }
}

/// The agent reaches retrieval through this seam, bound by tool name at
/// construction; nothing below the manager knows the agent exists.
#[async_trait]
impl KnowledgeSearch for KbManager {
    async fn search(&self, kb_id: &str, query: &str) -> Result<Vec<SearchHit>> {
        self.query(kb_id, query, &QueryOverrides::default()).await
    }
}

fn content_type_of(file_name: &str) -> String {
    match file_name.rsplit('.').next().map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
    .to_string()
}
