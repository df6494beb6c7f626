//! lbx-core: shared vocabulary for the lockbox client and server.
//!
//! - [`types`]: vault items, item kinds, timestamps, email syntax
//! - [`secret`]: the decrypted shape of an item value
//! - [`error`]: the error-kind taxonomy shared across the RPC boundary
//! - [`status`]: mapping between error kinds and `tonic::Status`
//! - [`config`]: TOML configuration for `lbxd` and the `lbx` client

pub mod config;
pub mod error;
pub mod secret;
pub mod status;
pub mod types;

pub use error::{CoreError, CoreResult, ErrorKind};
pub use secret::{Binary, Card, Meta, Password, SecretValue, Text};
pub use types::{is_valid_email, next_client_stamp, now_micros, ItemType, VaultItem};

/// Generated gRPC types and service traits (from lbx.proto)
pub mod proto {
    tonic::include_proto!("lbx");
}
