use meridian_core::CoreError;
use meridian_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("canonical entity not found: {0}")]
    CanonicalNotFound(String),

    #[error("intake record not found: {0}")]
    IntakeNotFound(String),

    #[error("intake record {0} is not rejected")]
    NotRejected(String),

    #[error("unknown view: {0}")]
    UnknownView(String),

    #[error("invalid resolution: {0}")]
    InvalidResolution(String),

    #[error("gave up after {attempts} conflicting attempts on {what}")]
    ConflictRetriesExhausted { what: String, attempts: u32 },

    #[error("projection render failed: {0}")]
    Render(String),
}

impl EngineError {
    /// Failures worth another attempt after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::ConflictRetriesExhausted { .. } => true,
            _ => false,
        }
    }
}
