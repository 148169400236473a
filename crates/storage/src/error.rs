use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("version conflict on {canonical_id}: expected {expected}, found {actual}")]
    VersionConflict {
        canonical_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("canonical entity {canonical_id} was merged into {survivor}")]
    Redirected {
        canonical_id: String,
        survivor: String,
    },

    #[error("tag {tag} already claimed by {owner}")]
    TagClaimed { tag: String, owner: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("core error: {0}")]
    Core(#[from] meridian_core::CoreError),
}

impl StorageError {
    /// Failures that may succeed when the same step is run again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::VersionConflict { .. } | Self::TagClaimed { .. } | Self::Redirected { .. } => {
                true
            }
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
