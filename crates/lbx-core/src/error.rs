use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::types::ItemType;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown item type discriminant: {0}")]
    UnknownItemType(i32),

    #[error("item type {0} has no decodable value shape")]
    UnsupportedItemType(ItemType),

    #[error("value codec error: {0}")]
    ValueCodec(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown error kind: {0}")]
    UnknownErrorKind(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Error taxonomy shared by server and client.
///
/// Every failure that crosses the RPC boundary carries exactly one kind, so
/// callers branch on the value instead of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // validation
    InvalidEmailFormat,
    InvalidHashFormat,
    InvalidArgument,
    VaultItemValueTooBig,
    // authentication / authorization
    UserAlreadyExists,
    UserNotExists,
    UserInvalidHash,
    UserEmailNotVerified,
    InvalidTokenFormat,
    UserNeedAuthentication,
    // optimistic concurrency
    VaultItemVersionConflict,
    // transport
    Unavailable,
    // everything else
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 13] = [
        ErrorKind::InvalidEmailFormat,
        ErrorKind::InvalidHashFormat,
        ErrorKind::InvalidArgument,
        ErrorKind::VaultItemValueTooBig,
        ErrorKind::UserAlreadyExists,
        ErrorKind::UserNotExists,
        ErrorKind::UserInvalidHash,
        ErrorKind::UserEmailNotVerified,
        ErrorKind::InvalidTokenFormat,
        ErrorKind::UserNeedAuthentication,
        ErrorKind::VaultItemVersionConflict,
        ErrorKind::Unavailable,
        ErrorKind::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidEmailFormat => "invalid_email_format",
            ErrorKind::InvalidHashFormat => "invalid_hash_format",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::VaultItemValueTooBig => "vault_item_value_too_big",
            ErrorKind::UserAlreadyExists => "user_already_exists",
            ErrorKind::UserNotExists => "user_not_exists",
            ErrorKind::UserInvalidHash => "user_invalid_hash",
            ErrorKind::UserEmailNotVerified => "user_email_not_verified",
            ErrorKind::InvalidTokenFormat => "invalid_token_format",
            ErrorKind::UserNeedAuthentication => "user_need_authentication",
            ErrorKind::VaultItemVersionConflict => "vault_item_version_conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }

    /// The session is unusable and the client must log in again.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            ErrorKind::UserNeedAuthentication | ErrorKind::InvalidTokenFormat
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownErrorKind(s.to_string()))
    }
}
