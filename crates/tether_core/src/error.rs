//! Error types for tether.
//!
//! Every low-level failure is wrapped with the operation that produced it
//! (open, ping, begin, prepare, exec, close, commit, scan) before it reaches
//! the caller.

use std::fmt;
use thiserror::Error;

/// Result alias used across the crate.
pub type TetherResult<T> = Result<T, TetherError>;

/// Boxed error source.
type Source = Box<dyn std::error::Error + Send + Sync>;

/// The phase of database work an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Opening a connection.
    Open,
    /// Liveness check on an open connection.
    Ping,
    /// Starting a transaction.
    Begin,
    /// Preparing the COPY statement.
    Prepare,
    /// Streaming a single row into the COPY statement.
    Exec {
        /// Zero-based index of the row being written.
        row: usize,
    },
    /// Finishing the COPY statement.
    Close,
    /// Committing the transaction.
    Commit,
    /// Reading rows back from a query.
    Scan,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Ping => f.write_str("ping"),
            Self::Begin => f.write_str("begin"),
            Self::Prepare => f.write_str("prepare"),
            Self::Exec { row } => write!(f, "exec (row {row})"),
            Self::Close => f.write_str("close"),
            Self::Commit => f.write_str("commit"),
            Self::Scan => f.write_str("scan"),
        }
    }
}

/// Main error type for tether.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Invalid configuration. Not recoverable: the process should not proceed.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Opening or checking a database connection failed.
    #[error("Connection error during {operation}: {message}")]
    Connection {
        /// Phase that failed.
        operation: Operation,
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Source>,
    },

    /// SSH tunnel error.
    #[error("Tunnel error: {message}")]
    Tunnel {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
    },

    /// A network call exceeded its deadline.
    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        /// Phase that timed out.
        operation: Operation,
        /// Deadline that was exceeded.
        elapsed_ms: u64,
    },

    /// Bulk load failed. Nothing from the batch was committed.
    #[error("Bulk load failed during {operation}: {message}")]
    Transaction {
        /// Phase that failed.
        operation: Operation,
        /// Human-readable error message.
        message: String,
        /// PostgreSQL error code (e.g., "23505").
        code: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Source>,
    },

    /// Reading or decoding a result row failed.
    #[error("Scan error at row {row}: {message}")]
    Scan {
        /// Zero-based index of the row being read.
        row: usize,
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Source>,
    },

    /// Query error reported by PostgreSQL.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// Request rejected before any I/O.
    #[error("Validation error: {message}")]
    Validation {
        /// Human-readable error message.
        message: String,
    },

    /// Monitor lifecycle misuse.
    #[error("Monitor error: {message}")]
    Monitor {
        /// Human-readable error message.
        message: String,
    },

    /// File system error.
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable error message.
        message: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// CSV parsing error.
    #[error("CSV error: {message}")]
    Csv {
        /// Human-readable error message.
        message: String,
        /// Underlying error.
        #[source]
        source: csv::Error,
    },
}

impl TetherError {
    // ========== Constructors ==========

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new connection error.
    pub fn connection(operation: Operation, message: impl Into<String>) -> Self {
        Self::Connection { operation, message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        operation: Operation,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { operation, message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new tunnel error with hint.
    pub fn tunnel_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a timeout error.
    pub fn timeout(operation: Operation, deadline: std::time::Duration) -> Self {
        Self::Timeout { operation, elapsed_ms: deadline.as_millis() as u64 }
    }

    /// Wrap a driver error raised while bulk loading.
    pub fn transaction(operation: Operation, err: tokio_postgres::Error) -> Self {
        let (message, code) = match err.as_db_error() {
            Some(db_err) => (db_err.message().to_string(), Some(db_err.code().code().to_string())),
            None => (err.to_string(), None),
        };
        Self::Transaction { operation, message, code, source: Some(Box::new(err)) }
    }

    /// Create a bulk load error that has no driver error behind it.
    pub fn transaction_aborted(operation: Operation, message: impl Into<String>) -> Self {
        Self::Transaction { operation, message: message.into(), code: None, source: None }
    }

    /// Create a new scan error.
    pub fn scan(row: usize, message: impl Into<String>) -> Self {
        Self::Scan { row, message: message.into(), source: None }
    }

    /// Create a new scan error with source.
    pub fn scan_with_source(
        row: usize,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Scan { row, message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Create a new monitor error.
    pub fn monitor(message: impl Into<String>) -> Self {
        Self::Monitor { message: message.into() }
    }

    // ========== Methods ==========

    /// Whether retrying later can succeed without changing configuration.
    ///
    /// Connectivity problems are recoverable; configuration problems are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. } | Self::Tunnel { .. })
    }

    /// Check if this error is a fatal configuration problem.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// The failing phase, when the error carries one.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Connection { operation, .. }
            | Self::Timeout { operation, .. }
            | Self::Transaction { operation, .. } => Some(*operation),
            Self::Scan { .. } => Some(Operation::Scan),
            _ => None,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Connection { .. } => "Connection",
            Self::Tunnel { .. } => "Tunnel",
            Self::Timeout { .. } => "Timeout",
            Self::Transaction { .. } => "Transaction",
            Self::Scan { .. } => "Scan",
            Self::Query { .. } => "Query",
            Self::Validation { .. } => "Validation",
            Self::Monitor { .. } => "Monitor",
            Self::Io { .. } => "I/O",
            Self::Csv { .. } => "CSV",
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { .. } => Some("Fix the configuration and restart"),
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::Tunnel { hint, .. } => hint.as_deref(),
            Self::Timeout { .. } => Some("The server or network may be overloaded"),
            Self::Transaction { code, .. } => match code.as_deref() {
                Some("23505") => Some("A row violates a unique constraint; no rows were written"),
                Some("23502") => {
                    Some("A row has a null in a NOT NULL column; no rows were written")
                }
                Some("22P02") => Some("A value could not be converted to the column type"),
                _ => Some("The whole batch was rolled back; retry it after fixing the cause"),
            },
            Self::Scan { .. } => None,
            Self::Query { hint, .. } => hint.as_deref(),
            Self::Validation { .. } => None,
            Self::Monitor { .. } => None,
            Self::Io { .. } => Some("Check file permissions and paths"),
            Self::Csv { .. } => Some("Check that every record has the same number of fields"),
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } | Self::Transaction { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to TetherError.
///
/// Used for plain queries; bulk loads and connectivity checks wrap driver
/// errors with their own operation instead.
impl From<tokio_postgres::Error> for TetherError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code = db_err.code().code();
            // Connection exceptions (08xxx)
            if code.starts_with("08") {
                return TetherError::Connection {
                    operation: Operation::Open,
                    message: db_err.message().to_string(),
                    source: Some(Box::new(err)),
                };
            }
            return TetherError::Query {
                message: db_err.message().to_string(),
                detail: db_err.detail().map(String::from),
                hint: db_err.hint().map(String::from),
                code: Some(code.to_string()),
            };
        }

        if err.is_closed() {
            return TetherError::Connection {
                operation: Operation::Ping,
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        TetherError::Connection {
            operation: Operation::Open,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from std::io::Error to TetherError.
impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Io { message: err.to_string(), source: err }
    }
}

/// Convert from csv::Error to TetherError.
impl From<csv::Error> for TetherError {
    fn from(err: csv::Error) -> Self {
        TetherError::Csv { message: err.to_string(), source: err }
    }
}

/// Convert from serde_json::Error to TetherError.
impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::config(format!("Invalid JSON configuration: {err}"))
    }
}
