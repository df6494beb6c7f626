//! Carrying [`ErrorKind`] across gRPC.
//!
//! The kind travels as the `lbx-error` metadata entry of a `tonic::Status`
//! next to a matching gRPC code. Statuses without the entry (proxies,
//! transport failures) fall back to a kind derived from the code.

use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

use crate::error::ErrorKind;

pub const ERROR_KIND_KEY: &str = "lbx-error";

/// Metadata key holding the session token on authenticated calls.
pub const TOKEN_KEY: &str = "token";

pub fn code_for(kind: ErrorKind) -> Code {
    match kind {
        ErrorKind::InvalidEmailFormat
        | ErrorKind::InvalidHashFormat
        | ErrorKind::InvalidArgument
        | ErrorKind::InvalidTokenFormat => Code::InvalidArgument,
        ErrorKind::VaultItemValueTooBig => Code::OutOfRange,
        ErrorKind::UserAlreadyExists => Code::AlreadyExists,
        ErrorKind::UserNotExists => Code::NotFound,
        ErrorKind::UserInvalidHash | ErrorKind::UserNeedAuthentication => Code::Unauthenticated,
        ErrorKind::UserEmailNotVerified => Code::FailedPrecondition,
        ErrorKind::VaultItemVersionConflict => Code::Aborted,
        ErrorKind::Unavailable => Code::Unavailable,
        ErrorKind::Internal => Code::Internal,
    }
}

/// Build the status sent to clients. Internal failures never carry detail.
pub fn to_status(kind: ErrorKind, message: impl Into<String>) -> Status {
    let message = match kind {
        ErrorKind::Internal => "internal error".to_string(),
        _ => message.into(),
    };
    let mut metadata = MetadataMap::new();
    metadata.insert(ERROR_KIND_KEY, MetadataValue::from_static(kind.as_str()));
    Status::with_metadata(code_for(kind), message, metadata)
}

/// Recover the kind of a status received from the server.
pub fn kind_of(status: &Status) -> ErrorKind {
    if let Some(kind) = status
        .metadata()
        .get(ERROR_KIND_KEY)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<ErrorKind>().ok())
    {
        return kind;
    }
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => ErrorKind::Unavailable,
        Code::Unauthenticated => ErrorKind::UserNeedAuthentication,
        Code::Aborted => ErrorKind::VaultItemVersionConflict,
        Code::InvalidArgument => ErrorKind::InvalidArgument,
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_status() {
        for kind in ErrorKind::ALL {
            let status = to_status(kind, "details");
            assert_eq!(kind_of(&status), kind);
            assert_eq!(status.code(), code_for(kind));
        }
    }

    #[test]
    fn test_internal_message_is_opaque() {
        let status = to_status(ErrorKind::Internal, "sqlite: disk I/O error at /var/lib");
        assert_eq!(status.message(), "internal error");
    }

    #[test]
    fn test_fallback_from_code() {
        assert_eq!(
            kind_of(&Status::unavailable("connection refused")),
            ErrorKind::Unavailable
        );
        assert_eq!(
            kind_of(&Status::unauthenticated("nope")),
            ErrorKind::UserNeedAuthentication
        );
        assert_eq!(kind_of(&Status::unknown("?")), ErrorKind::Internal);
    }

    #[test]
    fn test_distinct_kinds_share_code() {
        let hash = to_status(ErrorKind::UserInvalidHash, "");
        let auth = to_status(ErrorKind::UserNeedAuthentication, "");
        assert_eq!(hash.code(), auth.code());
        assert_ne!(kind_of(&hash), kind_of(&auth));
    }
}
