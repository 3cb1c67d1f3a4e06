use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use crate::backup::{HistorySink, OperationOutcome, SyncRequest};

/// SQLite-backed sync history.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub source: String,
    pub target: String,
    pub status: String,
    pub exit_code: Option<i64>,
    pub error_text: Option<String>,
    pub report_text: String,
    pub files_processed: i64,
    pub finished_at: String,
}

fn is_memory(database_url: &str) -> bool {
    database_url.contains(":memory:")
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        // Create the parent directory of a file database
        if !is_memory(database_url) {
            let path = database_url.strip_prefix("sqlite://").unwrap_or(database_url);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection would be a separate database.
        let max_connections = if is_memory(database_url) { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                status TEXT NOT NULL,
                exit_code INTEGER,
                error_text TEXT,
                report_text TEXT NOT NULL,
                files_processed BIGINT NOT NULL DEFAULT 0,
                finished_at TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_history_pair ON sync_history(source, target)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_outcome(&self, request: &SyncRequest, outcome: &OperationOutcome) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO sync_history
                (source, target, status, exit_code, error_text, report_text, files_processed, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(request.source.to_string_lossy().into_owned())
        .bind(request.target.to_string_lossy().into_owned())
        .bind(outcome.status.as_str())
        .bind(outcome.exit_code)
        .bind(outcome.error_text.as_deref())
        .bind(&outcome.report_text)
        .bind(outcome.files_processed as i64)
        .bind(outcome.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!("Recorded sync outcome {} as history row {}", outcome.status.as_str(), id);
        Ok(id)
    }

    pub async fn recent_history(&self, limit: i64) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, source, target, status, exit_code, error_text, report_text, files_processed, finished_at
            FROM sync_history
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    pub async fn history_for_pair(&self, source: &Path, target: &Path, limit: i64) -> Result<Vec<HistoryEntry>> {
        let entries = sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, source, target, status, exit_code, error_text, report_text, files_processed, finished_at
            FROM sync_history
            WHERE source = ?1 AND target = ?2
            ORDER BY id DESC
            LIMIT ?3
            "#,
        )
        .bind(source.to_string_lossy().into_owned())
        .bind(target.to_string_lossy().into_owned())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

#[async_trait]
impl HistorySink for Storage {
    async fn record(&self, request: &SyncRequest, outcome: &OperationOutcome) -> Result<()> {
        self.record_outcome(request, outcome).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{EngineError, OutcomeStatus};

    async fn memory_storage() -> Storage {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.run_migrations().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn records_and_lists_newest_first() {
        let storage = memory_storage().await;
        let request = SyncRequest::new("/data/a", "/mnt/a").unwrap();

        let mut success = OperationOutcome::new(OutcomeStatus::Success);
        success.exit_code = Some(0);
        success.files_processed = 12;
        success.report_text = ">f+++++++++ x\n".to_string();
        storage.record_outcome(&request, &success).await.unwrap();

        let failed = OperationOutcome::failed(&EngineError::DryRunParseFailed);
        storage.record(&request, &failed).await.unwrap();

        let entries = storage.recent_history(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, "failed");
        assert!(entries[0].exit_code.is_none());
        assert_eq!(entries[1].status, "success");
        assert_eq!(entries[1].exit_code, Some(0));
        assert_eq!(entries[1].files_processed, 12);
        assert_eq!(entries[1].source, "/data/a");
    }

    #[tokio::test]
    async fn history_is_keyed_by_pair() {
        let storage = memory_storage().await;
        let first = SyncRequest::new("/data/a", "/mnt/a").unwrap();
        let second = SyncRequest::new("/data/b", "/mnt/b").unwrap();
        let outcome = OperationOutcome::new(OutcomeStatus::Cancelled);

        storage.record_outcome(&first, &outcome).await.unwrap();
        storage.record_outcome(&second, &outcome).await.unwrap();
        storage.record_outcome(&second, &outcome).await.unwrap();

        let entries = storage
            .history_for_pair(Path::new("/data/b"), Path::new("/mnt/b"), 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.target == "/mnt/b"));
        assert_eq!(storage.recent_history(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_is_created_with_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.db");
        let url = format!("sqlite://{}", path.display());

        let storage = Storage::new(&url).await.unwrap();
        storage.run_migrations().await.unwrap();
        assert!(path.exists());
    }
}
