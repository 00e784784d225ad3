//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No registered encoder accepts the requested processing mode.
    #[error("No encoder found for mode: {0}")]
    NoEncoder(String),

    /// The external tool exited unsuccessfully. `log` holds its captured output.
    #[error("Encoding failed with code {code}: {log}")]
    Encoding { code: i32, log: String },

    /// The external process was forcibly terminated by a cancel request.
    #[error("Cancelled")]
    Cancelled,

    #[error("Encoding timed out after {0}s")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_message() {
        assert_eq!(Error::Cancelled.to_string(), "Cancelled");
    }

    #[test]
    fn test_encoding_message_carries_log() {
        let err = Error::Encoding {
            code: 3,
            log: "Traceback: boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("code 3"));
        assert!(msg.contains("Traceback: boom"));
    }

    #[test]
    fn test_no_encoder_message() {
        let err = Error::NoEncoder("QUANTUM".to_string());
        assert_eq!(err.to_string(), "No encoder found for mode: QUANTUM");
    }
}
