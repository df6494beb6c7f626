use lbx_core::ErrorKind;
use lbx_storage::StorageError;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Failures of the account and vault operations.
///
/// Every variant maps onto one [`ErrorKind`]; `Storage` and `Internal` carry
/// the failing operation for the log and are reported to clients without
/// detail.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid email address")]
    InvalidEmail,

    #[error("auth hash must not be empty")]
    InvalidHash,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("item value is {size} bytes, limit is {limit}")]
    ValueTooBig { size: usize, limit: usize },

    #[error("user already exists")]
    UserExists,

    #[error("user does not exist")]
    UserNotFound,

    #[error("wrong credentials")]
    WrongCredentials,

    #[error("email address not verified")]
    EmailNotVerified,

    #[error("malformed session token")]
    InvalidToken,

    #[error("authentication required")]
    NeedAuthentication,

    #[error("item {id} was modified by someone else")]
    VersionConflict { id: String },

    #[error("{op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("{op}: {message}")]
    Internal { op: &'static str, message: String },
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidEmail => ErrorKind::InvalidEmailFormat,
            ServiceError::InvalidHash => ErrorKind::InvalidHashFormat,
            ServiceError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ServiceError::ValueTooBig { .. } => ErrorKind::VaultItemValueTooBig,
            ServiceError::UserExists => ErrorKind::UserAlreadyExists,
            ServiceError::UserNotFound => ErrorKind::UserNotExists,
            ServiceError::WrongCredentials => ErrorKind::UserInvalidHash,
            ServiceError::EmailNotVerified => ErrorKind::UserEmailNotVerified,
            ServiceError::InvalidToken => ErrorKind::InvalidTokenFormat,
            ServiceError::NeedAuthentication => ErrorKind::UserNeedAuthentication,
            ServiceError::VersionConflict { .. } => ErrorKind::VaultItemVersionConflict,
            ServiceError::Storage { .. } | ServiceError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub(crate) fn storage(op: &'static str) -> impl FnOnce(StorageError) -> ServiceError {
        move |source| ServiceError::Storage { op, source }
    }

    pub(crate) fn internal(op: &'static str, message: impl ToString) -> ServiceError {
        ServiceError::Internal {
            op,
            message: message.to_string(),
        }
    }
}
