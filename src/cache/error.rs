//! Cache store error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Payload compression failed: {0}")]
    Compression(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record '{key}' is immutable: stored {stored}, attempted {attempted}")]
    ImmutableRecord {
        key: String,
        stored: String,
        attempted: String,
    },

    #[error("Schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immutable_record_display() {
        let err = CacheError::ImmutableRecord {
            key: "pipeline:p1:pl2".to_string(),
            stored: "failed@abc".to_string(),
            attempted: "success@def".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Record 'pipeline:p1:pl2' is immutable: stored failed@abc, attempted success@def"
        );
    }

    #[test]
    fn test_serialization_error_from() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: CacheError = json_err.into();
        assert!(matches!(err, CacheError::Serialization(_)));
    }
}
