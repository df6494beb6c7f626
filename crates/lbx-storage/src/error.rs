use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found")]
    NotFound,

    #[error("record already exists")]
    AlreadyExists,

    #[error("version conflict: stored version does not match expected {expected}")]
    VersionConflict { expected: i64 },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage lock poisoned")]
    Poisoned,

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StorageError {
    pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
        matches!(
            err,
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
