use thiserror::Error;

use crate::tasks::ProcessingStatus;

/// Run-level error. Only structure, configuration and store-setup failures
/// surface here; a single task's failure is recorded on the task instead.
#[derive(Debug, Error)]
pub enum CellRelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Invalid run configuration, detected before any task is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Config error: invalid column key '{0}' (expected an index or a column letter)")]
    InvalidColumnKey(String),

    #[error("Config error: unknown worker '{worker}' for {target}")]
    UnknownWorker { worker: String, target: String },

    #[error("Config error: worker '{worker}' could not be built: {reason}")]
    WorkerSetup { worker: String, reason: String },

    #[error("Config error: {0}")]
    Invalid(String),
}

/// The sheet does not have the layout the run needs. Fatal, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StructureError {
    #[error("Header row not found: no row with '{marker}' in column A (scanned {scanned} rows)")]
    HeaderNotFound { marker: String, scanned: usize },

    #[error("No task columns found: no cell equal to '{marker}' in header row {}", .header_row + 1)]
    NoTaskColumns { marker: String, header_row: usize },
}

/// Failure talking to the external tabular store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("quota exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("store API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl TransportError {
    /// Network hiccups, quota responses and 5xx are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::RateLimited { .. } => true,
            TransportError::Api { status, .. } => *status >= 500,
            TransportError::Malformed(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TransportError::Malformed(err.to_string())
        } else {
            TransportError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("a transaction is already open; transactions do not nest")]
    TransactionAlreadyOpen,

    #[error("no transaction is open")]
    NoOpenTransaction,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Task not found: row {row}, column {col}")]
    UnknownTask { row: usize, col: usize },

    #[error("Invalid transition for task (row {row}, column {col}): {from} -> {to}")]
    InvalidTransition {
        row: usize,
        col: usize,
        from: ProcessingStatus,
        to: ProcessingStatus,
    },
}

/// Error reported by a worker for one invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Consumes one attempt; the orchestrator tries again after backoff.
    #[error("{0}")]
    Retryable(String),
    /// Ends the retry loop for the task immediately.
    #[error("{0}")]
    Fatal(String),
}

impl WorkerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::Retryable(_) => ErrorKind::Retryable,
            WorkerError::Fatal(_) => ErrorKind::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            WorkerError::Retryable(msg) | WorkerError::Fatal(msg) => msg,
        }
    }
}

/// Classifies a worker failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Retryable,
    Fatal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Retryable => write!(f, "retryable"),
            ErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}
