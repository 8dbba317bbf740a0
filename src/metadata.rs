//! Persistent knowledge-base and file records.
//!
//! Backed by SQLite through sqlx. [`MetadataStore::open`] owns the whole
//! setup: connection pool, WAL journaling, foreign keys, and the
//! idempotent migrations. Three tables: `knowledge_bases`, `files`
//! (cascade-deleted with their KB), and `ingested_paths` (the `(path,
//! mtime)` ledger behind incremental re-indexing).
//!
//! Invariants enforced here:
//! - KB names are unique among live KBs; duplicates surface as `Conflict`.
//! - A file always references an existing KB; deleting the KB removes its
//!   files.
//! - `updated_at` never decreases on update.
//! - File status changes follow the lifecycle; an illegal transition is a
//!   `Conflict`.
//!
//! List operations read a consistent snapshot within one request; no
//! cross-request isolation is promised.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::models::{FileEntity, FileStatus, KnowledgeBase};

/// Writers queue briefly instead of failing when ingestion and the API
/// touch the same KB row.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_bases (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            embedding_model TEXT NOT NULL,
            embedding_dimension INTEGER NOT NULL,
            chunk_config TEXT NOT NULL,
            retrieval_config TEXT NOT NULL,
            collection_name TEXT NOT NULL UNIQUE,
            document_count INTEGER NOT NULL DEFAULT 0,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            kb_id TEXT NOT NULL,
            file_name TEXT NOT NULL,
            file_path TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            status TEXT NOT NULL,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            failed_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (kb_id) REFERENCES knowledge_bases(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingested_paths (
            kb_id TEXT NOT NULL,
            path TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (kb_id, path),
            FOREIGN KEY (kb_id) REFERENCES knowledge_bases(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_kb_id ON files(kb_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(kb_id, status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Data-access layer for KB and file records.
#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the store at `path` and bring the schema up to
    /// date. WAL mode lets searches read while an ingest writes; foreign
    /// keys back the file-to-KB cascade. The pool is sized for one writer
    /// per ingest worker plus API readers.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(BUSY_TIMEOUT)
                    .foreign_keys(true),
            )
            .await?;

        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// In-memory store for tests. A single connection keeps every query on
    /// the same transient database.
    #[cfg(test)]
    pub(crate) async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::new()
                    .in_memory(true)
                    .foreign_keys(true),
            )
            .await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Knowledge bases ============

    pub async fn create_kb(&self, kb: &KnowledgeBase) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO knowledge_bases
                (id, name, description, embedding_model, embedding_dimension,
                 chunk_config, retrieval_config, collection_name,
                 document_count, chunk_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&kb.id)
        .bind(&kb.name)
        .bind(&kb.description)
        .bind(&kb.embedding_model)
        .bind(kb.embedding_dimension as i64)
        .bind(serde_json::to_string(&kb.chunk_config)?)
        .bind(serde_json::to_string(&kb.retrieval_config)?)
        .bind(&kb.collection_name)
        .bind(kb.document_count)
        .bind(kb.chunk_count)
        .bind(kb.created_at.timestamp_millis())
        .bind(kb.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::Conflict(
                format!("knowledge base name '{}' already exists", kb.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_kb(&self, id: &str) -> Result<KnowledgeBase> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| kb_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("knowledge base '{id}'")))
    }

    pub async fn get_kb_by_name(&self, name: &str) -> Result<Option<KnowledgeBase>> {
        let row = sqlx::query("SELECT * FROM knowledge_bases WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| kb_from_row(&r)).transpose()
    }

    /// Page is 1-based. Ordering is `(created_at, id)`, which keeps a full
    /// pagination sweep free of duplicates and omissions.
    pub async fn list_kbs(&self, page: u32, size: u32) -> Result<(Vec<KnowledgeBase>, u64)> {
        let page = page.max(1);
        let size = size.max(1);
        let offset = (page - 1) as i64 * size as i64;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_bases")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT * FROM knowledge_bases ORDER BY created_at, id LIMIT ? OFFSET ?",
        )
        .bind(size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let kbs = rows
            .iter()
            .map(kb_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((kbs, total as u64))
    }

    /// Write back mutable KB fields. `updated_at` is clamped so it never
    /// moves backwards.
    pub async fn update_kb(&self, kb: &KnowledgeBase) -> Result<()> {
        let existing = self.get_kb(&kb.id).await?;
        let updated_at = Utc::now()
            .timestamp_millis()
            .max(existing.updated_at.timestamp_millis());

        let result = sqlx::query(
            r#"
            UPDATE knowledge_bases
            SET name = ?, description = ?, chunk_config = ?, retrieval_config = ?,
                document_count = ?, chunk_count = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&kb.name)
        .bind(&kb.description)
        .bind(serde_json::to_string(&kb.chunk_config)?)
        .bind(serde_json::to_string(&kb.retrieval_config)?)
        .bind(kb.document_count)
        .bind(kb.chunk_count)
        .bind(updated_at)
        .bind(&kb.id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(Error::Conflict(
                format!("knowledge base name '{}' already exists", kb.name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn bump_kb_counters(
        &self,
        kb_id: &str,
        document_delta: i64,
        chunk_delta: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE knowledge_bases
            SET document_count = MAX(0, document_count + ?),
                chunk_count = MAX(0, chunk_count + ?),
                updated_at = MAX(updated_at, ?)
            WHERE id = ?
            "#,
        )
        .bind(document_delta)
        .bind(chunk_delta)
        .bind(Utc::now().timestamp_millis())
        .bind(kb_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_kb(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM knowledge_bases WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("knowledge base '{id}'")));
        }
        Ok(())
    }

    // ============ Files ============

    pub async fn add_file(&self, file: &FileEntity) -> Result<()> {
        // The kb_id foreign key needs a live KB; surface a friendlier error
        // than a constraint failure.
        self.get_kb(&file.kb_id).await?;

        sqlx::query(
            r#"
            INSERT INTO files
                (id, kb_id, file_name, file_path, file_size, content_type,
                 status, chunk_count, failed_reason, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&file.id)
        .bind(&file.kb_id)
        .bind(&file.file_name)
        .bind(&file.file_path)
        .bind(file.file_size)
        .bind(&file.content_type)
        .bind(file.status.as_str())
        .bind(file.chunk_count)
        .bind(&file.failed_reason)
        .bind(file.created_at.timestamp_millis())
        .bind(file.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_file(&self, kb_id: &str, file_id: &str) -> Result<FileEntity> {
        let row = sqlx::query("SELECT * FROM files WHERE kb_id = ? AND id = ?")
            .bind(kb_id)
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| file_from_row(&r))
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("file '{file_id}' in knowledge base '{kb_id}'")))
    }

    /// Apply a lifecycle transition. `chunk_count` is written together with
    /// the status so a `succeeded` file's count becomes visible atomically.
    pub async fn update_file_status(
        &self,
        kb_id: &str,
        file_id: &str,
        status: FileStatus,
        chunk_count: Option<i64>,
        failed_reason: Option<String>,
    ) -> Result<()> {
        let current = self.get_file(kb_id, file_id).await?;
        if !current.status.can_transition_to(status) {
            return Err(Error::Conflict(format!(
                "file '{file_id}' cannot transition {} -> {}",
                current.status.as_str(),
                status.as_str()
            )));
        }

        let updated_at = Utc::now()
            .timestamp_millis()
            .max(current.updated_at.timestamp_millis());

        sqlx::query(
            r#"
            UPDATE files
            SET status = ?, chunk_count = COALESCE(?, chunk_count),
                failed_reason = ?, updated_at = ?
            WHERE kb_id = ? AND id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(chunk_count)
        .bind(&failed_reason)
        .bind(updated_at)
        .bind(kb_id)
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_files(
        &self,
        kb_id: &str,
        status: Option<FileStatus>,
        name_query: Option<&str>,
        page: u32,
        size: u32,
    ) -> Result<(Vec<FileEntity>, u64)> {
        let page = page.max(1);
        let size = size.max(1);
        let offset = (page - 1) as i64 * size as i64;
        let status_str = status.map(|s| s.as_str().to_string());
        let name_like = name_query.map(|q| format!("%{q}%"));

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM files
            WHERE kb_id = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR file_name LIKE ?)
            "#,
        )
        .bind(kb_id)
        .bind(&status_str)
        .bind(&status_str)
        .bind(&name_like)
        .bind(&name_like)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM files
            WHERE kb_id = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR file_name LIKE ?)
            ORDER BY created_at, id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(kb_id)
        .bind(&status_str)
        .bind(&status_str)
        .bind(&name_like)
        .bind(&name_like)
        .bind(size as i64)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let files = rows
            .iter()
            .map(file_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((files, total as u64))
    }

    pub async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM files WHERE kb_id = ? AND id = ?")
            .bind(kb_id)
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "file '{file_id}' in knowledge base '{kb_id}'"
            )));
        }
        Ok(())
    }

    // ============ Incremental-ingest ledger ============

    pub async fn ingested_mtime(&self, kb_id: &str, path: &str) -> Result<Option<i64>> {
        let mtime: Option<i64> =
            sqlx::query_scalar("SELECT mtime FROM ingested_paths WHERE kb_id = ? AND path = ?")
                .bind(kb_id)
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(mtime)
    }

    pub async fn record_ingested(&self, kb_id: &str, path: &str, mtime: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingested_paths (kb_id, path, mtime, updated_at) VALUES (?, ?, ?, ?)
            ON CONFLICT(kb_id, path) DO UPDATE SET
                mtime = excluded.mtime, updated_at = excluded.updated_at
            "#,
        )
        .bind(kb_id)
        .bind(path)
        .bind(mtime)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_ingested(&self, kb_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM ingested_paths WHERE kb_id = ?")
            .bind(kb_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn timestamp_from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

fn kb_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<KnowledgeBase> {
    let chunk_config: String = row.get("chunk_config");
    let retrieval_config: String = row.get("retrieval_config");
    Ok(KnowledgeBase {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        embedding_model: row.get("embedding_model"),
        embedding_dimension: row.get::<i64, _>("embedding_dimension") as usize,
        chunk_config: serde_json::from_str(&chunk_config)?,
        retrieval_config: serde_json::from_str(&retrieval_config)?,
        collection_name: row.get("collection_name"),
        document_count: row.get("document_count"),
        chunk_count: row.get("chunk_count"),
        created_at: timestamp_from_millis(row.get("created_at")),
        updated_at: timestamp_from_millis(row.get("updated_at")),
    })
}

fn file_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<FileEntity> {
    let status: String = row.get("status");
    Ok(FileEntity {
        id: row.get("id"),
        kb_id: row.get("kb_id"),
        file_name: row.get("file_name"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        content_type: row.get("content_type"),
        status: FileStatus::parse(&status)
            .ok_or_else(|| Error::Internal(format!("unknown file status '{status}'")))?,
        chunk_count: row.get("chunk_count"),
        failed_reason: row.get("failed_reason"),
        created_at: timestamp_from_millis(row.get("created_at")),
        updated_at: timestamp_from_millis(row.get("updated_at")),
    })
}
