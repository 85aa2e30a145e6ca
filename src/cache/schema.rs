//! SQLite schema for the cache store

use sqlx::SqlitePool;

use super::CacheError;

/// Current schema version
pub const SCHEMA_VERSION: i64 = 1;

/// Tables the store cannot work without
pub const REQUIRED_TABLES: &[&str] = &[
    "schema_version",
    "cache_entries",
    "cache_payloads",
    "cleanup_log",
];

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);

-- Record metadata; timestamps are unix milliseconds, NULL expires_at never expires
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    data_type TEXT NOT NULL,
    project_id INTEGER NOT NULL,
    pipeline_id INTEGER,
    job_id INTEGER,
    file_path TEXT,
    parser_type TEXT,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    size_bytes INTEGER NOT NULL,
    stored_bytes INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_project ON cache_entries(project_id);
CREATE INDEX IF NOT EXISTS idx_cache_entries_pipeline ON cache_entries(project_id, pipeline_id);
CREATE INDEX IF NOT EXISTS idx_cache_entries_job ON cache_entries(project_id, job_id);
CREATE INDEX IF NOT EXISTS idx_cache_entries_type ON cache_entries(data_type);
CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);

CREATE TABLE IF NOT EXISTS cache_payloads (
    key TEXT PRIMARY KEY REFERENCES cache_entries(key) ON DELETE CASCADE,
    data BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS cleanup_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ran_at INTEGER NOT NULL,
    operation TEXT NOT NULL,
    items_cleaned INTEGER NOT NULL,
    bytes_freed INTEGER NOT NULL
);
"#;

/// Create the schema on a fresh database and check the version of an existing one
pub async fn initialize(pool: &SqlitePool) -> Result<(), CacheError> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        tracing::debug!(version = SCHEMA_VERSION, "Initializing cache schema");
        let mut tx = pool.begin().await?;
        sqlx::query(SCHEMA).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_version (id, version, applied_at) VALUES (1, ?, ?)")
            .bind(SCHEMA_VERSION)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        return Ok(());
    }

    let found = schema_version(pool).await?.unwrap_or(0);
    if found != SCHEMA_VERSION {
        return Err(CacheError::SchemaMismatch {
            found,
            expected: SCHEMA_VERSION,
        });
    }
    // Tables added after the version row are created idempotently
    sqlx::query(SCHEMA).execute(pool).await?;
    Ok(())
}

pub async fn schema_version(pool: &SqlitePool) -> Result<Option<i64>, CacheError> {
    Ok(
        sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
            .fetch_optional(pool)
            .await?,
    )
}

/// Required tables absent from the database
pub async fn missing_tables(pool: &SqlitePool) -> Result<Vec<&'static str>, CacheError> {
    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(*table)
        .fetch_one(pool)
        .await?;
        if !exists {
            missing.push(*table);
        }
    }
    Ok(missing)
}
