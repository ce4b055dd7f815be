//! Error types for bulk operations.

use std::time::Duration;

use thiserror::Error;

/// Exit code for configuration errors (invalid YAML, unresolved table, bad mappings).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connectivity and pool errors.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for failures raised while a bulk operation was running.
pub const EXIT_OPERATION_ERROR: u8 = 3;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code when the operation was cancelled (SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for bulk operations.
#[derive(Error, Debug)]
pub enum BulkError {
    /// Configuration error (invalid YAML, unknown column, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL driver error
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// SQL Server driver error
    #[error("SQL Server error: {0}")]
    Mssql(#[from] tiberius::error::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A bulk operation failed against a specific table
    #[error("Bulk operation failed for table {table}: {message}")]
    Operation { table: String, message: String },

    /// No table name could be resolved for the request
    #[error("Cannot resolve a target table for bulk {operation}: pass a table name, use a named DataTable, or register a mapping for the entity type")]
    MissingTableName { operation: String },

    /// Update, merge and delete need qualifier columns or a primary key
    #[error("Table {0} has no primary key and no qualifier fields were given")]
    NoQualifiers(String),

    /// The operation exceeded its command timeout
    #[error("Bulk operation on {table} timed out after {after:?}")]
    Timeout { table: String, after: Duration },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation was cancelled through its cancellation token
    #[error("Bulk operation cancelled")]
    Cancelled,
}

impl BulkError {
    /// Whether the worker was dropped before its statement finished.
    pub fn is_abandoned(&self) -> bool {
        matches!(self, BulkError::Timeout { .. } | BulkError::Cancelled)
    }

    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        BulkError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an Operation error
    pub fn operation(table: impl Into<String>, message: impl Into<String>) -> Self {
        BulkError::Operation {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code used by the CLI for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BulkError::Config(_)
            | BulkError::MissingTableName { .. }
            | BulkError::NoQualifiers(_)
            | BulkError::Yaml(_) => EXIT_CONFIG_ERROR,
            BulkError::Postgres(_) | BulkError::Mssql(_) | BulkError::Pool { .. } => {
                EXIT_CONNECTION_ERROR
            }
            BulkError::Operation { .. } | BulkError::Timeout { .. } | BulkError::Json(_) => {
                EXIT_OPERATION_ERROR
            }
            BulkError::Io(_) => EXIT_IO_ERROR,
            BulkError::Cancelled => EXIT_CANCELLED,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for bulk operations.
pub type Result<T> = std::result::Result<T, BulkError>;
