use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Audit failures. Kept apart from `crate::Error` so a failed log write can never be
/// mistaken for a failed query.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("audit directory error: {0}")]
    Io(#[from] std::io::Error),
}

/// What gets written for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub prompt: String,
    pub sql: String,
    pub executed: bool,
    pub row_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryLogEntry {
    pub id: String,
    pub prompt: String,
    pub sql_query: String,
    pub executed: bool,
    pub row_count: Option<i64>,
    pub created_at: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditRecord) -> Result<(), AuditError>;
}

pub struct AuditLog {
    conn: Arc<Mutex<Connection>>,
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn init_schema(conn: &Connection) -> Result<(), AuditError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS query_log (
            id TEXT PRIMARY KEY,
            prompt TEXT NOT NULL,
            sql_query TEXT NOT NULL,
            executed BOOLEAN NOT NULL DEFAULT 0,
            row_count INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_query_log_created ON query_log(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_query_log_executed ON query_log(executed);
        ",
    )?;
    Ok(())
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Delete entries older than `days` days. Returns the number removed.
    pub async fn prune_older_than(&self, days: u32) -> Result<usize, AuditError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(i64::from(days)))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let db = self.conn.lock().await;
        let removed = db.execute("DELETE FROM query_log WHERE created_at < ?1", [cutoff])?;
        Ok(removed)
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<QueryLogEntry>, AuditError> {
        let db = self.conn.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, prompt, sql_query, executed, row_count, created_at
             FROM query_log
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(QueryLogEntry {
                id: row.get(0)?,
                prompt: row.get(1)?,
                sql_query: row.get(2)?,
                executed: row.get(3)?,
                row_count: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let entries = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    #[cfg(test)]
    async fn insert_at(&self, entry: &AuditRecord, created_at: &str) -> Result<(), AuditError> {
        let db = self.conn.lock().await;
        db.execute(
            "INSERT INTO query_log (id, prompt, sql_query, executed, row_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                entry.prompt,
                entry.sql,
                entry.executed,
                entry.row_count,
                created_at
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn record(&self, entry: AuditRecord) -> Result<(), AuditError> {
        let created_at = chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let db = self.conn.lock().await;
        db.execute(
            "INSERT INTO query_log (id, prompt, sql_query, executed, row_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                uuid::Uuid::new_v4().to_string(),
                entry.prompt,
                entry.sql,
                entry.executed,
                entry.row_count,
                created_at
            ],
        )?;
        Ok(())
    }
}
