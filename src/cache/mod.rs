//! Durable record cache backed by SQLite
//!
//! The only component that touches persistent storage. Records are JSON values stored
//! gzip-compressed next to a metadata row carrying their owner ids, type, and expiry:
//! - reads apply TTL expiry lazily, independent of the background sweep
//! - pipeline records in a terminal state are immutable until explicitly invalidated
//! - batches are written in one transaction
//! - misses computed through [`CacheStore::get_or_compute`] are single-flight per key
//! - every removal appends a row to the cleanup audit log

mod codec;
pub mod error;
mod key;
pub mod models;
mod schema;

pub use codec::calculate_size;
pub use error::CacheError;
pub use key::CacheKey;
pub use models::{
    CacheEntryInfo, CacheStats, CleanupRecord, DataType, EntryMeta, HealthCheck, HealthReport,
    HealthStatus, TypeStats,
};
pub use schema::SCHEMA_VERSION;

use crate::upstream::is_terminal_status;
use crate::util::KeyedLocks;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const BUSY_TIMEOUT_SECS: u64 = 5;

/// Expired-but-unswept entries above which health turns `warning`
const EXPIRED_BACKLOG_WARNING: i64 = 1_000;

/// One record of a [`CacheStore::set_many`] batch
#[derive(Debug, Clone)]
pub struct CacheWrite {
    pub key: String,
    pub value: Value,
    pub meta: EntryMeta,
}

impl CacheWrite {
    pub fn new(key: impl Into<String>, value: Value, meta: EntryMeta) -> Self {
        Self {
            key: key.into(),
            value,
            meta,
        }
    }
}

/// Which entries a removal operation targets
#[derive(Debug, Clone, Copy)]
enum Scope {
    Project(u64),
    Pipeline(u64, u64),
    Job(u64, u64),
    PipelineType(u64, u64, DataType),
    Type(DataType),
    CreatedBefore(i64),
    ExpiredAt(i64),
    All,
}

impl Scope {
    fn condition(&self) -> &'static str {
        match self {
            Scope::Project(_) => "project_id = ?",
            Scope::Pipeline(..) => "project_id = ? AND pipeline_id = ?",
            Scope::Job(..) => "project_id = ? AND job_id = ?",
            Scope::PipelineType(..) => "project_id = ? AND pipeline_id = ? AND data_type = ?",
            Scope::Type(_) => "data_type = ?",
            Scope::CreatedBefore(_) => "created_at < ?",
            Scope::ExpiredAt(_) => "expires_at IS NOT NULL AND expires_at <= ?",
            Scope::All => "1 = 1",
        }
    }

    fn bind<'q>(&self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        match *self {
            Scope::Project(project) => query.bind(project as i64),
            Scope::Pipeline(project, pipeline) => query.bind(project as i64).bind(pipeline as i64),
            Scope::Job(project, job) => query.bind(project as i64).bind(job as i64),
            Scope::PipelineType(project, pipeline, data_type) => query
                .bind(project as i64)
                .bind(pipeline as i64)
                .bind(data_type.as_str()),
            Scope::Type(data_type) => query.bind(data_type.as_str()),
            Scope::CreatedBefore(ts) | Scope::ExpiredAt(ts) => query.bind(ts),
            Scope::All => query,
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// SQLite-backed cache of pipeline, job, and error records
pub struct CacheStore {
    pool: SqlitePool,
    locks: KeyedLocks<String>,
}

impl CacheStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self, CacheError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool).await?;
        debug!(path = %path.display(), "Cache store opened");
        Ok(store)
    }

    /// Private in-memory database, mainly for tests
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // Every connection to :memory: is a separate database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, CacheError> {
        schema::initialize(&pool).await?;
        Ok(Self {
            pool,
            locks: KeyedLocks::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Cache store closed");
    }

    /// Stored value, or `None` when absent or expired
    pub async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let row: Option<(Vec<u8>, Option<i64>)> = sqlx::query_as(
            r#"
            SELECT p.data, m.expires_at
            FROM cache_entries m
            JOIN cache_payloads p ON p.key = m.key
            WHERE m.key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some((data, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at.is_some_and(|at| at <= Utc::now().timestamp_millis()) {
            debug!(key, "Cache entry expired");
            return Ok(None);
        }
        codec::decode(&data).map(Some)
    }

    /// [`get`](Self::get) deserialized into `T`
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Metadata of a stored entry, expired or not
    pub async fn entry_info(&self, key: &str) -> Result<Option<CacheEntryInfo>, CacheError> {
        type InfoRow = (
            String,
            String,
            i64,
            Option<i64>,
            Option<i64>,
            Option<String>,
            Option<String>,
            i64,
            Option<i64>,
            i64,
        );
        let row: Option<InfoRow> = sqlx::query_as(
            r#"
            SELECT key, data_type, project_id, pipeline_id, job_id, file_path, parser_type,
                   created_at, expires_at, size_bytes
            FROM cache_entries
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some((
            key,
            data_type,
            project_id,
            pipeline_id,
            job_id,
            file_path,
            parser_type,
            created_at,
            expires_at,
            size_bytes,
        )) = row
        else {
            return Ok(None);
        };
        let Ok(data_type) = data_type.parse::<DataType>() else {
            warn!(key = %key, data_type = %data_type, "Unknown data type in cache metadata");
            return Ok(None);
        };
        Ok(Some(CacheEntryInfo {
            key,
            data_type,
            project_id: project_id as u64,
            pipeline_id: pipeline_id.map(|id| id as u64),
            job_id: job_id.map(|id| id as u64),
            file_path,
            parser_type,
            created_at: from_millis(created_at),
            expires_at: expires_at.map(from_millis),
            size_bytes: size_bytes as u64,
        }))
    }

    /// Store `value` under `key`, replacing any earlier entry
    pub async fn set(&self, key: &str, value: &Value, meta: &EntryMeta) -> Result<(), CacheError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        Self::write_entry(&mut tx, key, value, meta, now).await?;
        tx.commit().await?;
        debug!(key, data_type = %meta.data_type, "Cache entry stored");
        Ok(())
    }

    /// Store a batch atomically: either every entry is written or none is
    pub async fn set_many(&self, entries: &[CacheWrite]) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            Self::write_entry(&mut tx, &entry.key, &entry.value, &entry.meta, now).await?;
        }
        tx.commit().await?;
        debug!(entries = entries.len(), "Cache batch stored");
        Ok(entries.len())
    }

    async fn write_entry(
        conn: &mut SqliteConnection,
        key: &str,
        value: &Value,
        meta: &EntryMeta,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        if meta.data_type == DataType::Pipeline {
            Self::check_pipeline_immutable(&mut *conn, key, value).await?;
        }

        let payload = codec::encode(value)?;
        let expires_at = meta.data_type.expires_at(now).map(|t| t.timestamp_millis());

        sqlx::query(
            r#"
            INSERT INTO cache_entries (key, data_type, project_id, pipeline_id, job_id, file_path,
                                       parser_type, created_at, expires_at, size_bytes, stored_bytes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                data_type = excluded.data_type,
                project_id = excluded.project_id,
                pipeline_id = excluded.pipeline_id,
                job_id = excluded.job_id,
                file_path = excluded.file_path,
                parser_type = excluded.parser_type,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at,
                size_bytes = excluded.size_bytes,
                stored_bytes = excluded.stored_bytes
            "#,
        )
        .bind(key)
        .bind(meta.data_type.as_str())
        .bind(meta.project_id as i64)
        .bind(meta.pipeline_id.map(|id| id as i64))
        .bind(meta.job_id.map(|id| id as i64))
        .bind(meta.file_path.as_deref())
        .bind(meta.parser_type.as_deref())
        .bind(now.timestamp_millis())
        .bind(expires_at)
        .bind(payload.size_bytes as i64)
        .bind(payload.compressed.len() as i64)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO cache_payloads (key, data) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET data = excluded.data",
        )
        .bind(key)
        .bind(payload.compressed)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// A stored terminal pipeline may only be rewritten with the same status and sha
    async fn check_pipeline_immutable(
        conn: &mut SqliteConnection,
        key: &str,
        value: &Value,
    ) -> Result<(), CacheError> {
        let existing: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT data FROM cache_payloads WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *conn)
                .await?;
        let Some((data,)) = existing else {
            return Ok(());
        };
        let stored = codec::decode(&data)?;

        let fingerprint = |v: &Value| {
            format!(
                "{}@{}",
                v.get("status").and_then(Value::as_str).unwrap_or(""),
                v.get("sha").and_then(Value::as_str).unwrap_or("")
            )
        };
        let stored_status = stored.get("status").and_then(Value::as_str).unwrap_or("");
        if !is_terminal_status(stored_status) {
            return Ok(());
        }
        let (before, after) = (fingerprint(&stored), fingerprint(value));
        if before != after {
            warn!(
                key,
                stored = %before,
                attempted = %after,
                "Refusing to overwrite pipeline record"
            );
            return Err(CacheError::ImmutableRecord {
                key: key.to_string(),
                stored: before,
                attempted: after,
            });
        }
        Ok(())
    }

    /// Return the stored value, or run `compute` once and store its result.
    ///
    /// Concurrent callers for the same key wait for the first computation and then read its
    /// stored value instead of computing again.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        meta: &EntryMeta,
        compute: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
        E: From<CacheError>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let _guard = self.locks.lock(key.to_string()).await;
        if let Some(value) = self.get(key).await? {
            debug!(key, "Computed by a concurrent caller");
            return Ok(value);
        }

        let value = compute().await?;
        self.set(key, &value, meta).await?;
        Ok(value)
    }

    pub async fn invalidate_project(&self, project_id: u64) -> Result<u64, CacheError> {
        self.remove(Scope::Project(project_id), "invalidate_project").await
    }

    pub async fn invalidate_pipeline(
        &self,
        project_id: u64,
        pipeline_id: u64,
    ) -> Result<u64, CacheError> {
        self.remove(Scope::Pipeline(project_id, pipeline_id), "invalidate_pipeline")
            .await
    }

    /// Remove every record owned by one job
    pub async fn invalidate_job(&self, project_id: u64, job_id: u64) -> Result<u64, CacheError> {
        self.remove(Scope::Job(project_id, job_id), "invalidate_job").await
    }

    /// Remove the records of one type attached to a pipeline
    pub async fn invalidate_pipeline_type(
        &self,
        project_id: u64,
        pipeline_id: u64,
        data_type: DataType,
    ) -> Result<u64, CacheError> {
        self.remove(
            Scope::PipelineType(project_id, pipeline_id, data_type),
            "invalidate_pipeline_type",
        )
        .await
    }

    pub async fn clear_cache_by_type(&self, data_type: DataType) -> Result<u64, CacheError> {
        self.remove(Scope::Type(data_type), "clear_by_type").await
    }

    /// Remove entries created more than `max_age` ago, whatever their TTL
    pub async fn clear_old_entries(&self, max_age: Duration) -> Result<u64, CacheError> {
        let cutoff = (Utc::now() - max_age).timestamp_millis();
        self.remove(Scope::CreatedBefore(cutoff), "clear_old_entries")
            .await
    }

    pub async fn clear_all(&self) -> Result<u64, CacheError> {
        self.remove(Scope::All, "clear_all").await
    }

    /// Sweep entries whose TTL has passed
    pub async fn cleanup_expired(&self) -> Result<u64, CacheError> {
        let now = Utc::now().timestamp_millis();
        self.remove(Scope::ExpiredAt(now), "cleanup_expired").await
    }

    /// Drop every record of a job and store `entries` in its place as one transaction
    pub async fn replace_job(
        &self,
        project_id: u64,
        job_id: u64,
        entries: &[CacheWrite],
    ) -> Result<u64, CacheError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let (removed, bytes) =
            Self::remove_in(&mut tx, Scope::Job(project_id, job_id), "invalidate_job").await?;
        for entry in entries {
            Self::write_entry(&mut tx, &entry.key, &entry.value, &entry.meta, now).await?;
        }
        tx.commit().await?;

        info!(
            job_id,
            removed,
            bytes_freed = bytes,
            entries = entries.len(),
            "Job records replaced"
        );
        Ok(removed)
    }

    async fn remove(&self, scope: Scope, operation: &str) -> Result<u64, CacheError> {
        let mut tx = self.pool.begin().await?;
        let (removed, bytes) = Self::remove_in(&mut tx, scope, operation).await?;
        tx.commit().await?;

        info!(operation, removed, bytes_freed = bytes, "Cache entries removed");
        Ok(removed)
    }

    /// Delete the entries in `scope` and log the removal; returns `(entries, bytes)`
    async fn remove_in(
        conn: &mut SqliteConnection,
        scope: Scope,
        operation: &str,
    ) -> Result<(u64, i64), CacheError> {
        let condition = scope.condition();
        let totals_sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries WHERE {condition}"
        );
        let delete_sql = format!("DELETE FROM cache_entries WHERE {condition}");

        let totals = scope
            .bind(sqlx::query(&totals_sql))
            .fetch_one(&mut *conn)
            .await?;
        let bytes: i64 = totals.try_get(1)?;
        let removed = scope
            .bind(sqlx::query(&delete_sql))
            .execute(&mut *conn)
            .await?
            .rows_affected();

        sqlx::query(
            "INSERT INTO cleanup_log (ran_at, operation, items_cleaned, bytes_freed) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(operation)
        .bind(removed as i64)
        .bind(bytes)
        .execute(&mut *conn)
        .await?;
        Ok((removed, bytes))
    }

    /// Most recent audit rows, newest first
    pub async fn cleanup_history(&self, limit: u32) -> Result<Vec<CleanupRecord>, CacheError> {
        let rows: Vec<(i64, String, i64, i64)> = sqlx::query_as(
            "SELECT ran_at, operation, items_cleaned, bytes_freed FROM cleanup_log ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ran_at, operation, items, bytes)| CleanupRecord {
                ran_at: from_millis(ran_at),
                operation,
                items_cleaned: items as u64,
                bytes_freed: bytes as u64,
            })
            .collect())
    }

    pub async fn get_stats(&self) -> Result<CacheStats, CacheError> {
        let now = Utc::now().timestamp_millis();
        let (total, bytes, stored, oldest, newest): (i64, i64, i64, Option<i64>, Option<i64>) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*), COALESCE(SUM(size_bytes), 0), COALESCE(SUM(stored_bytes), 0),
                       MIN(created_at), MAX(created_at)
                FROM cache_entries
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let by_type: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT data_type, COUNT(*), COALESCE(SUM(size_bytes), 0)
            FROM cache_entries
            GROUP BY data_type
            ORDER BY data_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let expired = self.expired_count(now).await?;
        let last_cleanup = self.cleanup_history(1).await?.into_iter().next();

        Ok(CacheStats {
            total_entries: total as u64,
            total_bytes: bytes as u64,
            stored_bytes: stored as u64,
            by_type: by_type
                .into_iter()
                .map(|(data_type, entries, bytes)| {
                    (
                        data_type,
                        TypeStats {
                            entries: entries as u64,
                            bytes: bytes as u64,
                        },
                    )
                })
                .collect(),
            oldest_entry: oldest.map(from_millis),
            newest_entry: newest.map(from_millis),
            expired_entries: expired as u64,
            last_cleanup,
        })
    }

    async fn expired_count(&self, now: i64) -> Result<i64, CacheError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM cache_entries WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?)
    }

    /// Reachability, schema integrity, and expired backlog
    pub async fn check_health(&self) -> HealthReport {
        let mut checks = Vec::new();

        if let Err(e) = sqlx::query("SELECT 1").execute(&self.pool).await {
            checks.push(HealthCheck::new(
                "connectivity",
                HealthStatus::Critical,
                e.to_string(),
            ));
            return HealthReport::from_checks(checks);
        }
        checks.push(HealthCheck::new(
            "connectivity",
            HealthStatus::Healthy,
            "database reachable",
        ));

        match schema::missing_tables(&self.pool).await {
            Ok(missing) if missing.is_empty() => checks.push(HealthCheck::new(
                "schema_tables",
                HealthStatus::Healthy,
                "all tables present",
            )),
            Ok(missing) => checks.push(HealthCheck::new(
                "schema_tables",
                HealthStatus::Critical,
                format!("missing tables: {}", missing.join(", ")),
            )),
            Err(e) => checks.push(HealthCheck::new(
                "schema_tables",
                HealthStatus::Critical,
                e.to_string(),
            )),
        }

        match schema::schema_version(&self.pool).await {
            Ok(Some(SCHEMA_VERSION)) => checks.push(HealthCheck::new(
                "schema_version",
                HealthStatus::Healthy,
                format!("version {SCHEMA_VERSION}"),
            )),
            Ok(found) => checks.push(HealthCheck::new(
                "schema_version",
                HealthStatus::Critical,
                format!("found {found:?}, expected {SCHEMA_VERSION}"),
            )),
            Err(e) => checks.push(HealthCheck::new(
                "schema_version",
                HealthStatus::Critical,
                e.to_string(),
            )),
        }

        match self.expired_count(Utc::now().timestamp_millis()).await {
            Ok(expired) if expired > EXPIRED_BACKLOG_WARNING => checks.push(HealthCheck::new(
                "expired_backlog",
                HealthStatus::Warning,
                format!("{expired} expired entries awaiting cleanup"),
            )),
            Ok(expired) => checks.push(HealthCheck::new(
                "expired_backlog",
                HealthStatus::Healthy,
                format!("{expired} expired entries"),
            )),
            Err(e) => checks.push(HealthCheck::new(
                "expired_backlog",
                HealthStatus::Warning,
                e.to_string(),
            )),
        }

        HealthReport::from_checks(checks)
    }

    /// Shift an entry's timestamps into the past
    #[cfg(test)]
    pub(crate) async fn backdate(&self, key: &str, by: Duration) -> Result<(), CacheError> {
        let ms = by.num_milliseconds();
        sqlx::query(
            "UPDATE cache_entries SET created_at = created_at - ?, expires_at = expires_at - ? WHERE key = ?",
        )
        .bind(ms)
        .bind(ms)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store() -> CacheStore {
        CacheStore::in_memory().await.unwrap()
    }

    fn job_meta(project: u64, pipeline: u64, job: u64) -> EntryMeta {
        EntryMeta::new(DataType::Job, project).pipeline(pipeline).job(job)
    }

    #[tokio::test]
    async fn test_missing_key_returns_none() {
        let store = store().await;
        assert!(store.get("missing-key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_and_get_roundtrip_with_metadata() {
        let store = store().await;
        let value = json!({"trace_hash": "abc", "error_count": 2});
        store
            .set("job:p1:j2", &value, &job_meta(1, 10, 2).parser("pytest"))
            .await
            .unwrap();

        assert_eq!(store.get("job:p1:j2").await.unwrap(), Some(value.clone()));
        let info = store.entry_info("job:p1:j2").await.unwrap().unwrap();
        assert_eq!(info.data_type, DataType::Job);
        assert_eq!(info.pipeline_id, Some(10));
        assert_eq!(info.parser_type.as_deref(), Some("pytest"));
        assert_eq!(info.size_bytes, calculate_size(&value).unwrap());
        assert!(info.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_job_entry_expires_after_ttl() {
        let store = store().await;
        store
            .set("job:p1:j1", &json!({"x": 1}), &job_meta(1, 1, 1))
            .await
            .unwrap();
        assert!(store.get("job:p1:j1").await.unwrap().is_some());

        store
            .backdate("job:p1:j1", Duration::hours(24) + Duration::seconds(1))
            .await
            .unwrap();
        assert!(store.get("job:p1:j1").await.unwrap().is_none());
        assert_eq!(store.get_stats().await.unwrap().expired_entries, 1);

        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert!(store.entry_info("job:p1:j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pipeline_entry_never_expires() {
        let store = store().await;
        let key = CacheKey::pipeline_record(1, 5);
        let meta = EntryMeta::new(DataType::Pipeline, 1).pipeline(5);
        store
            .set(&key, &json!({"status": "failed", "sha": "abc"}), &meta)
            .await
            .unwrap();
        store.backdate(&key, Duration::days(3650)).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_some());
        assert_eq!(store.cleanup_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_terminal_pipeline_is_immutable() {
        let store = store().await;
        let key = CacheKey::pipeline_record(1, 5);
        let meta = EntryMeta::new(DataType::Pipeline, 1).pipeline(5);
        store
            .set(&key, &json!({"status": "failed", "sha": "abc"}), &meta)
            .await
            .unwrap();

        // Same status and sha is an idempotent rewrite
        store
            .set(&key, &json!({"status": "failed", "sha": "abc", "web_url": "u"}), &meta)
            .await
            .unwrap();

        let err = store
            .set(&key, &json!({"status": "success", "sha": "def"}), &meta)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::ImmutableRecord { .. }));

        store.invalidate_pipeline(1, 5).await.unwrap();
        store
            .set(&key, &json!({"status": "success", "sha": "def"}), &meta)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_running_pipeline_can_be_updated() {
        let store = store().await;
        let key = CacheKey::pipeline_record(1, 6);
        let meta = EntryMeta::new(DataType::Pipeline, 1).pipeline(6);
        store
            .set(&key, &json!({"status": "running", "sha": "abc"}), &meta)
            .await
            .unwrap();
        store
            .set(&key, &json!({"status": "failed", "sha": "abc"}), &meta)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_many_is_atomic() {
        let store = store().await;
        let key = CacheKey::pipeline_record(1, 7);
        let meta = EntryMeta::new(DataType::Pipeline, 1).pipeline(7);
        store
            .set(&key, &json!({"status": "failed", "sha": "abc"}), &meta)
            .await
            .unwrap();

        let batch = vec![
            CacheWrite::new("job:p1:j1", json!({"a": 1}), job_meta(1, 7, 1)),
            CacheWrite::new(key.clone(), json!({"status": "success", "sha": "zzz"}), meta),
        ];
        assert!(store.set_many(&batch).await.is_err());
        assert!(store.get("job:p1:j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_job_swaps_records_in_one_transaction() {
        let store = store().await;
        store.set("job:p1:j1", &json!({"v": 1}), &job_meta(1, 7, 1)).await.unwrap();
        store
            .set("error:p1:j1:error_id=old", &json!({}), &job_meta(1, 7, 1))
            .await
            .unwrap();

        let removed = store
            .replace_job(
                1,
                1,
                &[CacheWrite::new("job:p1:j1", json!({"v": 2}), job_meta(1, 7, 1))],
            )
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get("job:p1:j1").await.unwrap().unwrap()["v"], 2);
        assert!(store.get("error:p1:j1:error_id=old").await.unwrap().is_none());
        assert_eq!(store.cleanup_history(1).await.unwrap()[0].operation, "invalidate_job");

        // A failing write keeps the old records in place
        let key = CacheKey::pipeline_record(1, 7);
        let meta = EntryMeta::new(DataType::Pipeline, 1).pipeline(7);
        store
            .set(&key, &json!({"status": "failed", "sha": "abc"}), &meta)
            .await
            .unwrap();
        let batch = vec![
            CacheWrite::new("job:p1:j1", json!({"v": 3}), job_meta(1, 7, 1)),
            CacheWrite::new(key, json!({"status": "success", "sha": "zzz"}), meta),
        ];
        assert!(store.replace_job(1, 1, &batch).await.is_err());
        assert_eq!(store.get("job:p1:j1").await.unwrap().unwrap()["v"], 2);
    }

    #[tokio::test]
    async fn test_invalidate_project_scoping() {
        let store = store().await;
        for job in 1..=3 {
            store
                .set(&format!("job:p1:j{job}"), &json!({}), &job_meta(1, 1, job))
                .await
                .unwrap();
        }
        store
            .set("job:p2:j9", &json!({}), &job_meta(2, 4, 9))
            .await
            .unwrap();

        assert_eq!(store.invalidate_project(1).await.unwrap(), 3);
        assert!(store.get("job:p2:j9").await.unwrap().is_some());
        assert_eq!(store.get_stats().await.unwrap().total_entries, 1);

        let history = store.cleanup_history(5).await.unwrap();
        assert_eq!(history[0].operation, "invalidate_project");
        assert_eq!(history[0].items_cleaned, 3);
    }

    #[tokio::test]
    async fn test_invalidate_job_and_pipeline_type() {
        let store = store().await;
        store.set("job:p1:j1", &json!({}), &job_meta(1, 1, 1)).await.unwrap();
        store.set("job:p1:j2", &json!({}), &job_meta(1, 1, 2)).await.unwrap();
        let resource = EntryMeta::new(DataType::Resource, 1).pipeline(1);
        store.set("resource:p1:pl1:mode=full", &json!({}), &resource).await.unwrap();

        assert_eq!(store.invalidate_job(1, 1).await.unwrap(), 1);
        assert_eq!(
            store
                .invalidate_pipeline_type(1, 1, DataType::Resource)
                .await
                .unwrap(),
            1
        );
        assert!(store.get("job:p1:j2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_clear_by_type_and_age() {
        let store = store().await;
        store
            .set("job:p1:j1", &json!({}), &job_meta(1, 1, 1))
            .await
            .unwrap();
        store
            .set("error:p1:j1:error_id=a", &json!({}), &EntryMeta::new(DataType::Error, 1).job(1))
            .await
            .unwrap();

        assert_eq!(store.clear_cache_by_type(DataType::Error).await.unwrap(), 1);
        store.backdate("job:p1:j1", Duration::hours(2)).await.unwrap();
        assert_eq!(store.clear_old_entries(Duration::hours(1)).await.unwrap(), 1);
        assert_eq!(store.clear_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_payload_cascade_on_delete() {
        let store = store().await;
        store
            .set("job:p1:j1", &json!({"big": "x"}), &job_meta(1, 1, 1))
            .await
            .unwrap();
        store.clear_all().await.unwrap();
        let payloads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_payloads")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(payloads, 0);
    }

    #[tokio::test]
    async fn test_stats_recomputed_from_metadata() {
        let store = store().await;
        let value = json!({"message": "boom"});
        store.set("job:p1:j1", &value, &job_meta(1, 1, 1)).await.unwrap();
        store
            .set("error:p1:j1:error_id=a", &value, &EntryMeta::new(DataType::Error, 1).job(1))
            .await
            .unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_bytes, 2 * calculate_size(&value).unwrap());
        assert_eq!(stats.by_type["job"].entries, 1);
        assert_eq!(stats.by_type["error"].entries, 1);
        assert!(stats.oldest_entry.is_some());
    }

    #[tokio::test]
    async fn test_get_or_compute_single_flight() {
        let store = Arc::new(store().await);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = Arc::clone(&store);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let meta = EntryMeta::new(DataType::Analysis, 1).pipeline(1);
                store
                    .get_or_compute("analysis:p1:pl1", &meta, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok::<_, CacheError>(json!({"computed": true}))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), json!({"computed": true}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_health_of_fresh_store() {
        let store = store().await;
        let report = store.check_health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.checks.len(), 4);
    }

    #[tokio::test]
    async fn test_health_critical_when_table_dropped() {
        let store = store().await;
        sqlx::query("DROP TABLE cleanup_log")
            .execute(store.pool())
            .await
            .unwrap();
        assert_eq!(store.check_health().await.status, HealthStatus::Critical);
    }

    #[tokio::test]
    async fn test_file_store_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        {
            let store = CacheStore::open(&path, 2).await.unwrap();
            store
                .set("job:p1:j1", &json!({"kept": true}), &job_meta(1, 1, 1))
                .await
                .unwrap();
            store.close().await;
        }
        let store = CacheStore::open(&path, 2).await.unwrap();
        assert_eq!(store.get("job:p1:j1").await.unwrap(), Some(json!({"kept": true})));
    }
}
