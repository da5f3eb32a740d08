//! Error types for SMS Ingest.

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluator error: {0}")]
    Evaluator(#[from] EvaluatorError),
}

impl Error {
    /// Whether this failure is infrastructure-level and worth a retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Evaluator(e) => e.is_transient(),
        }
    }
}

/// Message/conversation store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: i64 },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// I/O-class store failures are retried; schema/lookup failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Open(_) | Self::Query(_) | Self::Io(_))
    }
}

/// Errors from the blocking and content-filter evaluators.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    #[error("Evaluator {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Evaluator {name} rejected input: {reason}")]
    InvalidInput { name: String, reason: String },
}

impl EvaluatorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
