//! Error types and result handling for pg-publisher.
//!
//! This module defines the main error type [`Error`], a convenience
//! [`Result`] alias, and [`FaultKind`], which sorts every error into the
//! publisher's failure taxonomy.
//!
//! # Example
//!
//! ```rust
//! use pg_publisher::{Error, FaultKind, Result};
//!
//! fn load_checkpoint() -> Result<i64> {
//!     Err(Error::NotFound {
//!         message: "no checkpoint for publisher-0".to_string(),
//!     })
//! }
//!
//! match load_checkpoint() {
//!     Ok(v) => println!("resuming from {}", v),
//!     Err(e) if e.kind() == FaultKind::NotFound => println!("first run"),
//!     Err(e) => eprintln!("startup failed: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for pg-publisher operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or malformed setting, detected at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding rows or checkpoint files.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from checkpoint file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Kubernetes API error from the lease lock.
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A query against the watched table failed.
    #[error("Query error: {message}")]
    Query {
        /// Description of the failed query
        message: String,
    },

    /// The requested record or relation does not exist.
    #[error("Not found: {message}")]
    NotFound {
        /// What was looked up
        message: String,
    },

    /// A fetched row is missing its watermark column or holds a value that
    /// cannot be read as a watermark.
    #[error("Malformed row: column '{column}' {message}")]
    MalformedRow {
        /// The watermark column name
        column: String,
        /// What was wrong with it
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Leader election failure.
    #[error("Leadership error: {message}")]
    Leadership {
        /// Description of the failure
        message: String,
    },

    /// The run was cancelled before the operation could complete.
    #[error("Shutdown requested")]
    Shutdown,
}

/// Failure classes the publisher reacts to differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Fatal at startup; the process exits.
    Configuration,
    /// An unreachable or failing dependency; retried on the next tick.
    Connectivity,
    /// A row breaks the watermark contract; truncates the current tick.
    Data,
    /// Expected absence, e.g. no checkpoint on first run.
    NotFound,
}

impl Error {
    /// Classifies this error.
    pub fn kind(&self) -> FaultKind {
        match self {
            Error::Config(_) => FaultKind::Configuration,
            Error::NotFound { .. } => FaultKind::NotFound,
            Error::MalformedRow { .. } => FaultKind::Data,
            Error::Postgres(_)
            | Error::Kafka(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Kube(_)
            | Error::Query { .. }
            | Error::Timeout { .. }
            | Error::Leadership { .. }
            | Error::Shutdown => FaultKind::Connectivity,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == FaultKind::NotFound
    }
}

/// A convenient Result type alias for pg-publisher operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_classification() {
        assert_eq!(
            Error::Config("BATCH_SIZE is empty".to_string()).kind(),
            FaultKind::Configuration
        );
        assert_eq!(
            Error::Query {
                message: "connection reset".to_string()
            }
            .kind(),
            FaultKind::Connectivity
        );
        assert_eq!(
            Error::MalformedRow {
                column: "version".to_string(),
                message: "is missing".to_string()
            }
            .kind(),
            FaultKind::Data
        );

        let missing = Error::NotFound {
            message: "checkpoint".to_string(),
        };
        assert!(missing.is_not_found());
        assert!(!Error::Shutdown.is_not_found());
    }

    #[test]
    fn test_malformed_row_message() {
        let err = Error::MalformedRow {
            column: "version".to_string(),
            message: "is missing".to_string(),
        };
        assert_eq!(err.to_string(), "Malformed row: column 'version' is missing");
    }
}
