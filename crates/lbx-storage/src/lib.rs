//! lbx-storage: persistence contracts and their SQLite engines
//!
//! Client side:
//!   - [`VaultStore`]: vault items plus the conflict shelf
//!   - [`CredentialStore`]: owner email, encryption key, session token
//!   - [`SqliteLocalStore`] implements both over one database
//!
//! Server side:
//!   - [`ServerStore`]: users and the compare-and-swap vault write path
//!   - [`SqliteServerStore`]
//!
//! Shared:
//!   - [`KvCache`]: TTL key/value cache where a miss is `Ok(None)`
//!   - [`MemoryCache`]

pub mod cache;
pub mod error;
pub mod local;
pub mod server;

pub use cache::{KvCache, MemoryCache};
pub use error::{StorageError, StorageResult};
pub use local::{
    CredentialStore, LocalEdit, RemoteApply, SqliteLocalStore, StoredCredentials, VaultStore,
};
pub use server::{ServerStore, SqliteServerStore, User};
