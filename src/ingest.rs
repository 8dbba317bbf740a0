//! Ingestion pipeline: loader → chunker → embedder → vector upload.
//!
//! Files are processed on a bounded worker pool; a failing file never
//! aborts its siblings. Each file walks the lifecycle
//! `pending → parsing → persisting → succeeded | failed`, and the returned
//! [`IngestionReport`] aggregates every failure — the report is produced
//! even when all files failed.
//!
//! Incremental mode: without `force`, a file whose mtime has not advanced
//! since its last successful ingest is skipped. With `force`, the KB's
//! collection is dropped and rebuilt from scratch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::chunker::split_documents;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::loader;
use crate::metadata::MetadataStore;
use crate::models::{FileEntity, FileStatus, KnowledgeBase, Payload, VectorPoint};
use crate::vectorstore::VectorStore;

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub documents_loaded: usize,
    pub chunks_created: usize,
    pub vectors_uploaded: usize,
    pub failed_files: Vec<String>,
    pub errors: Vec<String>,
    pub skipped_files: usize,
    pub total_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

struct FileOutcome {
    path: String,
    documents_loaded: usize,
    chunks_created: usize,
    vectors_uploaded: usize,
    skipped: bool,
    error: Option<String>,
}

/// Slim view of a single-file outcome for the upload path.
#[derive(Debug)]
pub struct FileOutcomeSummary {
    pub chunks_created: usize,
    pub vectors_uploaded: usize,
    pub error: Option<String>,
}

/// Orchestrates the per-file ingest flow against one KB's collection.
#[derive(Clone)]
pub struct IngestionPipeline {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    metadata: MetadataStore,
    max_file_bytes: u64,
    worker_pool: usize,
}

impl IngestionPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        metadata: MetadataStore,
        max_file_bytes: u64,
        worker_pool: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            metadata,
            max_file_bytes,
            worker_pool: worker_pool.max(1),
        }
    }

    /// Ingest files into the KB. Setup failures (unreachable vector store)
    /// error out; per-file failures land in the report.
    pub async fn ingest(
        &self,
        kb: &KnowledgeBase,
        paths: &[PathBuf],
        force: bool,
    ) -> Result<IngestionReport> {
        let started = Instant::now();

        if force {
            self.store.delete_collection(&kb.collection_name).await?;
            self.metadata.clear_ingested(&kb.id).await?;
        }
        self.store
            .ensure_collection(&kb.collection_name, kb.embedding_dimension)
            .await?;

        let semaphore = Arc::new(Semaphore::new(self.worker_pool));
        let mut tasks: JoinSet<FileOutcome> = JoinSet::new();

        for path in paths {
            let pipeline = self.clone();
            let kb = kb.clone();
            let path = path.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                pipeline.process_file(&kb, &path, force).await
            });
        }

        let mut report = IngestionReport {
            documents_loaded: 0,
            chunks_created: 0,
            vectors_uploaded: 0,
            failed_files: Vec::new(),
            errors: Vec::new(),
            skipped_files: 0,
            total_seconds: 0.0,
            timestamp: Utc::now(),
        };

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    report.errors.push(format!("ingest worker panicked: {e}"));
                    continue;
                }
            };
            report.documents_loaded += outcome.documents_loaded;
            report.chunks_created += outcome.chunks_created;
            report.vectors_uploaded += outcome.vectors_uploaded;
            if outcome.skipped {
                report.skipped_files += 1;
            }
            if let Some(error) = outcome.error {
                report.failed_files.push(outcome.path.clone());
                report.errors.push(format!("{}: {error}", outcome.path));
            }
        }

        report.total_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            kb_id = %kb.id,
            documents = report.documents_loaded,
            chunks = report.chunks_created,
            vectors = report.vectors_uploaded,
            failed = report.failed_files.len(),
            skipped = report.skipped_files,
            "ingestion finished"
        );
        Ok(report)
    }

    /// Ingest one already-registered file entity (the upload path).
    pub async fn ingest_file_entity(
        &self,
        kb: &KnowledgeBase,
        file: &FileEntity,
    ) -> Result<FileOutcomeSummary> {
        self.store
            .ensure_collection(&kb.collection_name, kb.embedding_dimension)
            .await?;
        let outcome = self
            .run_file_flow(kb, Path::new(&file.file_path), &file.id)
            .await;
        Ok(FileOutcomeSummary {
            chunks_created: outcome.chunks_created,
            vectors_uploaded: outcome.vectors_uploaded,
            error: outcome.error,
        })
    }

    async fn process_file(&self, kb: &KnowledgeBase, path: &Path, force: bool) -> FileOutcome {
        let display_path = path.display().to_string();

        let mtime = file_mtime(path);
        if !force {
            if let (Some(current), Ok(Some(recorded))) =
                (mtime, self.metadata.ingested_mtime(&kb.id, &display_path).await)
            {
                if current <= recorded {
                    tracing::debug!(path = %display_path, "unchanged since last ingest, skipping");
                    return FileOutcome {
                        path: display_path,
                        documents_loaded: 0,
                        chunks_created: 0,
                        vectors_uploaded: 0,
                        skipped: true,
                        error: None,
                    };
                }
            }
        }

        let file_id = Uuid::new_v4().to_string();
        let entity = FileEntity {
            id: file_id.clone(),
            kb_id: kb.id.clone(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| display_path.clone()),
            file_path: display_path.clone(),
            file_size: std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0),
            content_type: content_type_for(path),
            status: FileStatus::Pending,
            chunk_count: 0,
            failed_reason: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        if let Err(e) = self.metadata.add_file(&entity).await {
            return FileOutcome {
                path: display_path,
                documents_loaded: 0,
                chunks_created: 0,
                vectors_uploaded: 0,
                skipped: false,
                error: Some(e.to_string()),
            };
        }

        let mut outcome = self.run_file_flow(kb, path, &file_id).await;
        if outcome.error.is_none() && !outcome.skipped {
            if let Some(mtime) = mtime {
                if let Err(e) = self.metadata.record_ingested(&kb.id, &display_path, mtime).await {
                    tracing::warn!(path = %display_path, error = %e, "failed to record ingest mtime");
                }
            }
        }
        outcome.path = display_path;
        outcome
    }

    /// The strictly ordered single-file sequence: parse, chunk, embed,
    /// upload, account.
    async fn run_file_flow(&self, kb: &KnowledgeBase, path: &Path, file_id: &str) -> FileOutcome {
        let display_path = path.display().to_string();
        let fail = |error: Error| FileOutcome {
            path: display_path.clone(),
            documents_loaded: 0,
            chunks_created: 0,
            vectors_uploaded: 0,
            skipped: false,
            error: Some(error.to_string()),
        };

        self.set_status(kb, file_id, FileStatus::Parsing, None, None)
            .await;

        let documents = match loader::load_file(path, self.max_file_bytes) {
            Ok(docs) => docs,
            Err(e) => {
                self.set_status(kb, file_id, FileStatus::Failed, None, Some(e.to_string()))
                    .await;
                return fail(e);
            }
        };
        let documents_loaded = documents.len();

        let chunks = match split_documents(&documents, &kb.chunk_config) {
            Ok(chunks) => chunks,
            Err(e) => {
                self.set_status(kb, file_id, FileStatus::Failed, None, Some(e.to_string()))
                    .await;
                return fail(e);
            }
        };

        if chunks.is_empty() {
            // An empty file still succeeds, with nothing to upload.
            self.set_status(kb, file_id, FileStatus::Persisting, None, None)
                .await;
            self.set_status(kb, file_id, FileStatus::Succeeded, Some(0), None)
                .await;
            self.bump_counters(kb, documents_loaded as i64, 0).await;
            return FileOutcome {
                path: display_path,
                documents_loaded,
                chunks_created: 0,
                vectors_uploaded: 0,
                skipped: false,
                error: None,
            };
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = match self.embedder.embed_documents(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                self.set_status(kb, file_id, FileStatus::Failed, None, Some(e.to_string()))
                    .await;
                return fail(e);
            }
        };

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                let mut extra = chunk.metadata.clone();
                extra.remove("source");
                VectorPoint {
                    id: Uuid::new_v4().to_string(),
                    vector,
                    payload: Payload {
                        text: chunk.content.clone(),
                        source: chunk.source.clone(),
                        file_id: file_id.to_string(),
                        kb_id: kb.id.clone(),
                        chunk_index: chunk.chunk_index,
                        extra,
                    },
                }
            })
            .collect();

        self.set_status(kb, file_id, FileStatus::Persisting, None, None)
            .await;

        let uploaded = points.len();
        if let Err(e) = self.store.upsert(&kb.collection_name, points).await {
            self.set_status(kb, file_id, FileStatus::Failed, None, Some(e.to_string()))
                .await;
            return fail(e);
        }

        self.set_status(
            kb,
            file_id,
            FileStatus::Succeeded,
            Some(chunks.len() as i64),
            None,
        )
        .await;
        self.bump_counters(kb, documents_loaded as i64, chunks.len() as i64)
            .await;

        FileOutcome {
            path: display_path,
            documents_loaded,
            chunks_created: chunks.len(),
            vectors_uploaded: uploaded,
            skipped: false,
            error: None,
        }
    }

    async fn set_status(
        &self,
        kb: &KnowledgeBase,
        file_id: &str,
        status: FileStatus,
        chunk_count: Option<i64>,
        failed_reason: Option<String>,
    ) {
        if let Err(e) = self
            .metadata
            .update_file_status(&kb.id, file_id, status, chunk_count, failed_reason)
            .await
        {
            tracing::warn!(file_id, error = %e, "status update failed");
        }
    }

    async fn bump_counters(&self, kb: &KnowledgeBase, documents: i64, chunks: i64) {
        if let Err(e) = self.metadata.bump_kb_counters(&kb.id, documents, chunks).await {
            tracing::warn!(kb_id = %kb.id, error = %e, "counter update failed");
        }
    }
}

fn file_mtime(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

fn content_type_for(path: &Path) -> String {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("pdf") => "application/pdf",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{collection_name_for, ChunkConfig, RetrievalConfig};
    use crate::vectorstore::MemoryVectorStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Deterministic embedder: buckets character codes into `dim` slots.
    pub struct HashEmbedder {
        pub dim: usize,
    }

    impl HashEmbedder {
        fn embed_one(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dim];
            for (i, c) in text.chars().enumerate() {
                v[(c as usize + i) % self.dim] += 1.0;
            }
            v
        }
    }

    #[async_trait]
    impl Embedder for HashEmbedder {
        fn model_name(&self) -> &str {
            "hash-test"
        }
        fn dimension(&self) -> usize {
            self.dim
        }
        async fn embed_query(&self, text: &str) -> crate::error::Result<Vec<f32>> {
            Ok(self.embed_one(text))
        }
        async fn embed_documents(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|t| self.embed_one(t)).collect())
        }
        async fn check_available(&self) -> bool {
            true
        }
    }

    /// Embedder that always reports a dimension mismatch.
    struct DriftingEmbedder;

    #[async_trait]
    impl Embedder for DriftingEmbedder {
        fn model_name(&self) -> &str {
            "drift-test"
        }
        fn dimension(&self) -> usize {
            1024
        }
        async fn embed_query(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Err(Error::Embedding(
                "dimension mismatch: expected 1024, got 768".to_string(),
            ))
        }
        async fn embed_documents(&self, _texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Err(Error::Embedding(
                "dimension mismatch: expected 1024, got 768".to_string(),
            ))
        }
        async fn check_available(&self) -> bool {
            true
        }
    }

    async fn setup(dim: usize) -> (MetadataStore, Arc<MemoryVectorStore>, KnowledgeBase) {
        let metadata = MetadataStore::open_in_memory().await.unwrap();

        let now = Utc::now();
        let kb = KnowledgeBase {
            id: "kb1".to_string(),
            name: "notes".to_string(),
            description: String::new(),
            embedding_model: "hash-test".to_string(),
            embedding_dimension: dim,
            chunk_config: ChunkConfig {
                chunk_size: 200,
                chunk_overlap: 20,
                respect_sentence_boundary: true,
                chinese_aware: false,
            },
            retrieval_config: RetrievalConfig::default(),
            collection_name: collection_name_for("kb1"),
            document_count: 0,
            chunk_count: 0,
            created_at: now,
            updated_at: now,
        };
        metadata.create_kb(&kb).await.unwrap();
        (metadata, Arc::new(MemoryVectorStore::new()), kb)
    }

    fn make_pipeline(
        metadata: &MetadataStore,
        store: &Arc<MemoryVectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> IngestionPipeline {
        IngestionPipeline::new(
            embedder,
            Arc::clone(store) as Arc<dyn VectorStore>,
            metadata.clone(),
            1024 * 1024,
            4,
        )
    }

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn happy_path_uploads_all_chunks() {
        let (metadata, store, kb) = setup(8).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(HashEmbedder { dim: 8 }));

        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", &"Facts about alpha systems. ".repeat(20));
        let b = write(&dir, "b.txt", &"Notes about beta systems. ".repeat(20));

        let report = pipeline.ingest(&kb, &[a, b], false).await.unwrap();
        assert_eq!(report.documents_loaded, 2);
        assert!(report.chunks_created > 0);
        assert_eq!(report.vectors_uploaded, report.chunks_created);
        assert!(report.failed_files.is_empty());

        let count = store.count(&kb.collection_name).await.unwrap();
        assert_eq!(count as usize, report.vectors_uploaded);

        let refreshed = metadata.get_kb("kb1").await.unwrap();
        assert_eq!(refreshed.document_count, 2);
        assert_eq!(refreshed.chunk_count as usize, report.chunks_created);

        let (files, _) = metadata.list_files("kb1", None, None, 1, 10).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.status == FileStatus::Succeeded));
    }

    #[tokio::test]
    async fn unsupported_file_fails_without_aborting_siblings() {
        let (metadata, store, kb) = setup(8).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(HashEmbedder { dim: 8 }));

        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", "Alpha content with enough words to chunk.");
        let b = write(&dir, "b.txt", "Beta content with enough words to chunk.");
        let z = write(&dir, "archive.zip", "PK");

        let report = pipeline
            .ingest(&kb, &[a, b, z.clone()], false)
            .await
            .unwrap();
        assert_eq!(report.documents_loaded, 2);
        assert_eq!(report.failed_files, vec![z.display().to_string()]);
        assert_eq!(report.vectors_uploaded, report.chunks_created);
        assert!(!report.errors.is_empty());
    }

    #[tokio::test]
    async fn dimension_drift_fails_file_and_leaves_collection_untouched() {
        let (metadata, store, kb) = setup(1024).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(DriftingEmbedder));

        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", "Content that would normally be embedded.");

        let report = pipeline.ingest(&kb, &[a.clone()], false).await.unwrap();
        assert_eq!(report.failed_files, vec![a.display().to_string()]);
        assert!(report.errors[0].contains("dimension mismatch"));
        assert_eq!(report.vectors_uploaded, 0);
        assert_eq!(store.count(&kb.collection_name).await.unwrap(), 0);

        let (files, _) = metadata.list_files("kb1", None, None, 1, 10).await.unwrap();
        assert_eq!(files[0].status, FileStatus::Failed);
        assert!(files[0]
            .failed_reason
            .as_deref()
            .unwrap()
            .contains("dimension"));
    }

    #[tokio::test]
    async fn empty_file_succeeds_with_zero_chunks() {
        let (metadata, store, kb) = setup(8).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(HashEmbedder { dim: 8 }));

        let dir = TempDir::new().unwrap();
        let empty = write(&dir, "empty.txt", "");

        let report = pipeline.ingest(&kb, &[empty], false).await.unwrap();
        assert_eq!(report.documents_loaded, 1);
        assert_eq!(report.chunks_created, 0);
        assert_eq!(report.vectors_uploaded, 0);
        assert!(report.failed_files.is_empty());

        let (files, _) = metadata.list_files("kb1", None, None, 1, 10).await.unwrap();
        assert_eq!(files[0].status, FileStatus::Succeeded);
        assert_eq!(files[0].chunk_count, 0);
    }

    #[tokio::test]
    async fn reingest_without_force_skips_unchanged_files() {
        let (metadata, store, kb) = setup(8).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(HashEmbedder { dim: 8 }));

        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", &"Stable content for reingest. ".repeat(10));

        let first = pipeline.ingest(&kb, &[a.clone()], false).await.unwrap();
        assert!(first.vectors_uploaded > 0);
        let count_after_first = store.count(&kb.collection_name).await.unwrap();

        let second = pipeline.ingest(&kb, &[a], false).await.unwrap();
        assert_eq!(second.documents_loaded, 0);
        assert_eq!(second.chunks_created, 0);
        assert_eq!(second.vectors_uploaded, 0);
        assert_eq!(second.skipped_files, 1);
        assert_eq!(
            store.count(&kb.collection_name).await.unwrap(),
            count_after_first
        );
    }

    #[tokio::test]
    async fn force_rebuilds_collection_without_doubling() {
        let (metadata, store, kb) = setup(8).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(HashEmbedder { dim: 8 }));

        let dir = TempDir::new().unwrap();
        let a = write(&dir, "a.txt", &"Content for force rebuild. ".repeat(10));

        let first = pipeline.ingest(&kb, &[a.clone()], false).await.unwrap();
        let second = pipeline.ingest(&kb, &[a], true).await.unwrap();
        assert_eq!(second.vectors_uploaded, first.vectors_uploaded);
        assert_eq!(
            store.count(&kb.collection_name).await.unwrap() as usize,
            second.vectors_uploaded
        );
    }

    #[tokio::test]
    async fn report_accounting_is_consistent() {
        let (metadata, store, kb) = setup(8).await;
        let pipeline = make_pipeline(&metadata, &store, Arc::new(HashEmbedder { dim: 8 }));

        let dir = TempDir::new().unwrap();
        let paths: Vec<PathBuf> = (0..5)
            .map(|i| {
                write(
                    &dir,
                    &format!("f{i}.txt"),
                    &format!("Document {i}. ").repeat(30),
                )
            })
            .collect();

        let report = pipeline.ingest(&kb, &paths, false).await.unwrap();
        assert!(report.vectors_uploaded <= report.chunks_created);
        assert!(report.chunks_created >= report.documents_loaded);
        assert_eq!(report.documents_loaded, 5);
    }
}
