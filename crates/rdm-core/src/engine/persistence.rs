//! Task record persistence
//!
//! The engine treats the task table as a generic keyed store behind the
//! [`TaskStore`] trait. [`SqliteTaskStore`] is the durable implementation,
//! [`MemoryTaskStore`] keeps records in process (tests, embedders).

use crate::error::RdmError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rdm_types::{ControlFlag, TaskId, TaskRecord, TaskStatus, TaskUpdate};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Keyed storage for task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record
    async fn insert(&self, record: &TaskRecord) -> Result<(), RdmError>;

    /// Apply a partial update. Returns `false` when no record has this id.
    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<bool, RdmError>;

    async fn get_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, RdmError>;

    /// All records, oldest first
    async fn list_all(&self) -> Result<Vec<TaskRecord>, RdmError>;

    /// Remove a record. Returns `false` when no record has this id.
    async fn delete(&self, id: TaskId) -> Result<bool, RdmError>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite backed task store
#[derive(Clone, Debug)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Open (and create if needed) the database at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, RdmError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY,
                uri TEXT NOT NULL,
                filename TEXT NOT NULL,
                filepath TEXT NOT NULL,
                mimetype TEXT,
                etag TEXT,
                total_bytes INTEGER NOT NULL DEFAULT -1,
                current_bytes INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL,
                control INTEGER NOT NULL DEFAULT 0,
                num_failed INTEGER NOT NULL DEFAULT 0,
                useragent TEXT,
                headers TEXT NOT NULL DEFAULT '[]',
                allowed_network_types INTEGER NOT NULL DEFAULT -1,
                bypass_size_limit INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                lastmod TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), RdmError> {
        let headers = serde_json::to_string(&record.request_headers)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, uri, filename, filepath, mimetype, etag, total_bytes, current_bytes,
                status, control, num_failed, useragent, headers, allowed_network_types,
                bypass_size_limit, created_at, lastmod
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id)
        .bind(&record.source_uri)
        .bind(&record.file_name)
        .bind(record.destination_path.to_string_lossy().to_string())
        .bind(record.mime_type.as_ref())
        .bind(record.resumption_tag.as_ref())
        .bind(total_to_column(record.total_bytes))
        .bind(record.bytes_so_far as i64)
        .bind(record.status.code() as i64)
        .bind(record.control.code() as i64)
        .bind(record.failure_count as i64)
        .bind(record.user_agent.as_ref())
        .bind(headers)
        .bind(record.allowed_network_types as i32 as i64)
        .bind(if record.bypass_recommended_size_limit { 1i64 } else { 0i64 })
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_modified.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<bool, RdmError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE tasks SET ");
        {
            let mut set = query.separated(", ");
            if let Some(uri) = &update.source_uri {
                set.push("uri = ").push_bind_unseparated(uri.clone());
            }
            if let Some(mime_type) = &update.mime_type {
                set.push("mimetype = ").push_bind_unseparated(mime_type.clone());
            }
            if let Some(tag) = &update.resumption_tag {
                set.push("etag = ").push_bind_unseparated(tag.clone());
            }
            if let Some(total) = update.total_bytes {
                set.push("total_bytes = ")
                    .push_bind_unseparated(total_to_column(total));
            }
            if let Some(bytes) = update.bytes_so_far {
                set.push("current_bytes = ").push_bind_unseparated(bytes as i64);
            }
            if let Some(status) = update.status {
                set.push("status = ").push_bind_unseparated(status.code() as i64);
            }
            if let Some(control) = update.control {
                set.push("control = ").push_bind_unseparated(control.code() as i64);
            }
            if let Some(count) = update.failure_count {
                set.push("num_failed = ").push_bind_unseparated(count as i64);
            }
            set.push("lastmod = ")
                .push_bind_unseparated(Utc::now().to_rfc3339());
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, RdmError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_record).transpose()
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>, RdmError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    async fn delete(&self, id: TaskId) -> Result<bool, RdmError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn total_to_column(total: Option<u64>) -> i64 {
    total.map(|t| t as i64).unwrap_or(-1)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RdmError> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| RdmError::Serialization(e.to_string()))
}

/// Convert a database row to a task record
fn row_to_record(row: SqliteRow) -> Result<TaskRecord, RdmError> {
    let status_code = row.get::<i64, _>("status");
    let status = u16::try_from(status_code)
        .ok()
        .and_then(TaskStatus::from_code)
        .ok_or_else(|| RdmError::Serialization(format!("invalid status {}", status_code)))?;

    let control_code = row.get::<i64, _>("control");
    let control = u8::try_from(control_code)
        .ok()
        .and_then(ControlFlag::from_code)
        .ok_or_else(|| RdmError::Serialization(format!("invalid control {}", control_code)))?;

    let total = row.get::<i64, _>("total_bytes");
    let headers: Vec<(String, String)> = serde_json::from_str(row.get::<String, _>("headers").as_str())?;

    Ok(TaskRecord {
        id: row.get("id"),
        source_uri: row.get("uri"),
        file_name: row.get("filename"),
        destination_path: PathBuf::from(row.get::<String, _>("filepath")),
        mime_type: row.get("mimetype"),
        resumption_tag: row.get("etag"),
        total_bytes: (total >= 0).then_some(total as u64),
        bytes_so_far: row.get::<i64, _>("current_bytes").max(0) as u64,
        status,
        control,
        failure_count: row.get::<i64, _>("num_failed").max(0) as u32,
        user_agent: row.get("useragent"),
        request_headers: headers,
        allowed_network_types: row.get::<i64, _>("allowed_network_types") as u32,
        bypass_recommended_size_limit: row.get::<i64, _>("bypass_size_limit") != 0,
        created_at: parse_timestamp(row.get::<String, _>("created_at").as_str())?,
        last_modified: parse_timestamp(row.get::<String, _>("lastmod").as_str())?,
    })
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local task store
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    records: RwLock<BTreeMap<TaskId, TaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, record: &TaskRecord) -> Result<(), RdmError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(RdmError::Unknown(format!("task {} already exists", record.id)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<bool, RdmError> {
        match self.records.write().get_mut(&id) {
            Some(record) => {
                update.apply_to(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<TaskRecord>, RdmError> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>, RdmError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn delete(&self, id: TaskId) -> Result<bool, RdmError> {
        Ok(self.records.write().remove(&id).is_some())
    }
}
