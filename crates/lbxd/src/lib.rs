//! lbxd: the lockbox server
//!
//! - [`auth`]: registration, login, email verification, session tokens
//! - [`vault`]: listing and compare-and-swap writes of encrypted items
//! - [`mail`] + [`queue`]: verification mail jobs on a background worker pool
//! - [`grpc`]: tonic services, the token interceptor, error mapping
//! - [`metrics`]: Prometheus registry and the /metrics, /healthz, /readyz endpoints
//! - [`daemon`]: wiring from [`lbx_core::config::ServerConfig`]

pub mod auth;
pub mod daemon;
pub mod error;
pub mod grpc;
pub mod mail;
pub mod metrics;
pub mod queue;
pub mod vault;

pub use auth::{AuthService, AuthSettings, Session};
pub use error::{ServiceError, ServiceResult};
pub use vault::{SetOutcome, VaultService};
