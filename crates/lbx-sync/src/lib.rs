//! lbx-sync: the lockbox client
//!
//! - [`remote`]: what the client needs from lbxd, and the tonic implementation
//! - [`engine`]: pull/push sync cycle with the conflict shelf
//! - [`scheduler`]: periodic cancellable sync loop
//! - [`client`]: account flows and encrypted item access

pub mod client;
pub mod engine;
pub mod remote;
pub mod scheduler;

pub use client::{ClientError, ClientResult, ItemSummary, LoginMode, OpenedItem, VaultClient};
pub use engine::{EditPush, LocalStore, SyncEngine, SyncError, SyncOutcome, SyncReport};
pub use remote::{GrpcRemote, RemoteError, RemoteResult, SetResult, VaultRemote};
pub use scheduler::{run_scheduler, ScheduleSettings};
