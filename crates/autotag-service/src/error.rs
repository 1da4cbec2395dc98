use autotag_ai::ClassifierError;
use autotag_store::StoreError;
use thiserror::Error;

/// Failures surfaced to a transport.
///
/// `NotFound` and `Validation` are the caller's fault and leave no trace in
/// the store. `Transient` means the cycle was rolled back and may be retried.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("ticket {0} not found")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("storage failure, nothing was written: {0}")]
    Transient(#[from] StoreError),

    #[error("classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("failed to load corpus: {0:#}")]
    Corpus(anyhow::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ServiceError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
