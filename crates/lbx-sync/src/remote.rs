//! Remote vault access: the lbxd operations the client consumes.
//!
//! [`VaultRemote`] is the seam between the sync engine and the network.
//! [`GrpcRemote`] is the production implementation over tonic; tests plug in
//! in-memory or in-process servers.

use std::future::Future;
use std::time::Duration;

use lbx_core::config::RemoteConfig;
use lbx_core::proto::{
    user_service_client::UserServiceClient, vault_service_client::VaultServiceClient,
    ListVaultItemsRequest, LoginRequest, LogoutRequest, RegisterRequest, SetVaultItemRequest,
};
use lbx_core::status::{kind_of, TOKEN_KEY};
use lbx_core::{ErrorKind, VaultItem};
use lbx_crypto::AuthHash;
use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Status};

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{kind}: {message}")]
    Rejected { kind: ErrorKind, message: String },

    #[error("invalid endpoint {endpoint}: {message}")]
    Endpoint { endpoint: String, message: String },

    #[error("malformed response: {0}")]
    Protocol(String),
}

impl RemoteError {
    pub fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Rejected { kind, .. } => *kind,
            RemoteError::Endpoint { .. } => ErrorKind::InvalidArgument,
            RemoteError::Protocol(_) => ErrorKind::Internal,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        self.kind().is_auth_failure()
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::VaultItemVersionConflict
    }
}

impl From<Status> for RemoteError {
    fn from(status: Status) -> Self {
        RemoteError::Rejected {
            kind: kind_of(&status),
            message: status.message().to_string(),
        }
    }
}

/// Server acknowledgement of a vault write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetResult {
    /// Canonical id; differs from the pushed one only when that was empty
    pub id: String,
    pub version: i64,
}

pub trait VaultRemote: Send + Sync {
    fn register(
        &self,
        email: &str,
        auth_hash: &AuthHash,
    ) -> impl Future<Output = RemoteResult<()>> + Send;

    /// Returns a session token.
    fn login(
        &self,
        email: &str,
        auth_hash: &AuthHash,
        email_code: Option<&str>,
    ) -> impl Future<Output = RemoteResult<String>> + Send;

    /// Items with a version after `since` (all items for `None`), oldest first.
    fn list_vault_items(
        &self,
        token: &str,
        since: Option<i64>,
    ) -> impl Future<Output = RemoteResult<Vec<VaultItem>>> + Send;

    /// Compare-and-swap write; `item.server_updated_at` is the expected version.
    fn set_vault_item(
        &self,
        token: &str,
        item: VaultItem,
    ) -> impl Future<Output = RemoteResult<SetResult>> + Send;

    fn logout(&self, token: &str) -> impl Future<Output = RemoteResult<()>> + Send;
}

impl<T: VaultRemote> VaultRemote for std::sync::Arc<T> {
    fn register(
        &self,
        email: &str,
        auth_hash: &AuthHash,
    ) -> impl Future<Output = RemoteResult<()>> + Send {
        T::register(self, email, auth_hash)
    }

    fn login(
        &self,
        email: &str,
        auth_hash: &AuthHash,
        email_code: Option<&str>,
    ) -> impl Future<Output = RemoteResult<String>> + Send {
        T::login(self, email, auth_hash, email_code)
    }

    fn list_vault_items(
        &self,
        token: &str,
        since: Option<i64>,
    ) -> impl Future<Output = RemoteResult<Vec<VaultItem>>> + Send {
        T::list_vault_items(self, token, since)
    }

    fn set_vault_item(
        &self,
        token: &str,
        item: VaultItem,
    ) -> impl Future<Output = RemoteResult<SetResult>> + Send {
        T::set_vault_item(self, token, item)
    }

    fn logout(&self, token: &str) -> impl Future<Output = RemoteResult<()>> + Send {
        T::logout(self, token)
    }
}

// ── gRPC ─────────────────────────────────────────────────────────────────────

/// [`VaultRemote`] over a lazily connected tonic channel.
#[derive(Clone)]
pub struct GrpcRemote {
    users: UserServiceClient<Channel>,
    vault: VaultServiceClient<Channel>,
}

impl GrpcRemote {
    /// Must be called inside a tokio runtime. No connection is made until
    /// the first call, so an unreachable server surfaces as `Unavailable`
    /// on that call instead of failing here.
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let endpoint = Endpoint::from_shared(config.endpoint.clone())
            .map_err(|e| RemoteError::Endpoint {
                endpoint: config.endpoint.clone(),
                message: e.to_string(),
            })?
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.rpc_timeout_secs));
        Ok(Self::from_channel(endpoint.connect_lazy()))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            users: UserServiceClient::new(channel.clone()),
            vault: VaultServiceClient::new(channel),
        }
    }
}

fn authed<T>(message: T, token: &str) -> RemoteResult<Request<T>> {
    let value = MetadataValue::try_from(token)
        .map_err(|_| RemoteError::rejected(ErrorKind::InvalidTokenFormat, "token is not ascii"))?;
    let mut request = Request::new(message);
    request.metadata_mut().insert(TOKEN_KEY, value);
    Ok(request)
}

impl VaultRemote for GrpcRemote {
    async fn register(&self, email: &str, auth_hash: &AuthHash) -> RemoteResult<()> {
        self.users
            .clone()
            .register(RegisterRequest {
                email: email.to_string(),
                auth_hash: auth_hash.as_bytes().to_vec(),
            })
            .await?;
        Ok(())
    }

    async fn login(
        &self,
        email: &str,
        auth_hash: &AuthHash,
        email_code: Option<&str>,
    ) -> RemoteResult<String> {
        let response = self
            .users
            .clone()
            .login(LoginRequest {
                email: email.to_string(),
                auth_hash: auth_hash.as_bytes().to_vec(),
                email_code: email_code.map(str::to_string),
            })
            .await?;
        let token = response.into_inner().token;
        if token.is_empty() {
            return Err(RemoteError::Protocol("login returned an empty token".into()));
        }
        Ok(token)
    }

    async fn list_vault_items(&self, token: &str, since: Option<i64>) -> RemoteResult<Vec<VaultItem>> {
        let request = authed(ListVaultItemsRequest { since }, token)?;
        let items = self.vault.clone().list_vault_items(request).await?.into_inner().items;
        items
            .into_iter()
            .map(|item| VaultItem::try_from(item).map_err(|e| RemoteError::Protocol(e.to_string())))
            .collect()
    }

    async fn set_vault_item(&self, token: &str, item: VaultItem) -> RemoteResult<SetResult> {
        let request = authed(
            SetVaultItemRequest {
                item: Some(item.into()),
            },
            token,
        )?;
        let response = self.vault.clone().set_vault_item(request).await?.into_inner();
        Ok(SetResult {
            id: response.id,
            version: response.server_updated_at,
        })
    }

    async fn logout(&self, token: &str) -> RemoteResult<()> {
        self.vault.clone().logout(authed(LogoutRequest {}, token)?).await?;
        Ok(())
    }
}
