// src/errors.rs
use thiserror::Error;

/// Typed failures surfaced by the scoring engine.
///
/// Every variant is a reported outcome for the caller; none of them takes the
/// serving path down. A rolled-back retraining run is not an error and is reported
/// through `RetrainOutcome` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or missing input attribute. Caller error, not retried.
    #[error("schema mismatch on '{field}': {reason}")]
    SchemaMismatch { field: String, reason: String },

    /// Not enough rows (or a single class) in one of the dataset splits.
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Feedback store cannot support a retraining run yet.
    #[error("insufficient feedback: {0}")]
    InsufficientFeedback(String),

    /// No artifact has been committed yet.
    #[error("no model has been trained yet")]
    ModelNotTrained,

    /// A retraining run is already in flight. Retry later.
    #[error("a retraining run is already in progress")]
    RetrainInProgress,

    /// The artifact lacks the grouping metadata needed to explain a prediction.
    #[error("model v{version} has no usable feature schema metadata: {reason}")]
    ModelSchemaMissing { version: u64, reason: String },

    /// Training did not finish within the configured budget. Retry-able.
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },

    /// Training was abandoned through its cancellation flag.
    #[error("training cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn schema_mismatch(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::SchemaMismatch {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may simply retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RetrainInProgress | EngineError::Timeout { .. } | EngineError::Storage(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
