//! Shared fixtures: a real lbxd stack, served either in-process or over a
//! loopback gRPC listener.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lbx_core::{ErrorKind, VaultItem};
use lbx_crypto::{AuthHash, KdfParams, TokenSigner};
use lbx_storage::{KvCache, MemoryCache, SqliteLocalStore, SqliteServerStore};
use lbx_sync::{RemoteError, RemoteResult, SetResult, VaultClient, VaultRemote};
use lbxd::grpc::{serve, GrpcServices};
use lbxd::metrics::ServerMetrics;
use lbxd::queue::{local_queue, JobReceiver};
use lbxd::{AuthService, AuthSettings, ServiceError, VaultService};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub const PASSWORD: &str = "correct horse battery";

pub fn fast_kdf() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

pub fn secret(s: &str) -> SecretString {
    SecretString::from(s.to_string())
}

/// One lbxd instance with its mail jobs left unconsumed.
pub struct Backend {
    pub auth: Arc<AuthService>,
    pub vault: Arc<VaultService>,
    pub codes: Arc<MemoryCache>,
    pub metrics: ServerMetrics,
    /// (id, ciphertext) of every write accepted through a [`DirectRemote`]
    pub accepted: Mutex<Vec<(String, Vec<u8>)>>,
    _jobs: JobReceiver,
}

impl Backend {
    pub fn new() -> Arc<Self> {
        let store = Arc::new(SqliteServerStore::in_memory().unwrap());
        let codes = Arc::new(MemoryCache::new());
        let (queue, jobs) = local_queue();
        let auth = Arc::new(AuthService::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            codes.clone(),
            Arc::new(queue),
            TokenSigner::new(&[7u8; 32]).unwrap(),
            AuthSettings {
                token_lifetime: Duration::from_secs(3600),
                email_code_length: 6,
                email_code_lifetime: Duration::from_secs(3600),
                mail_job_timeout: Duration::from_secs(3),
                auth_key_params: fast_kdf(),
            },
            Span::none(),
        ));
        let metrics = ServerMetrics::default();
        let vault = Arc::new(VaultService::new(
            store,
            Arc::new(MemoryCache::new()),
            Duration::from_secs(3600),
            64 * 1024,
            metrics.clone(),
            Span::none(),
        ));
        Arc::new(Self {
            auth,
            vault,
            codes,
            metrics,
            accepted: Mutex::new(Vec::new()),
            _jobs: jobs,
        })
    }

    /// The verification code most recently issued to `email`.
    pub fn code_for(&self, email: &str) -> String {
        self.codes.get(email).unwrap().expect("no code issued")
    }

    pub fn was_accepted(&self, id: &str, value: &[u8]) -> bool {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .any(|(i, v)| i == id && v == value)
    }

    /// Serve this backend on a loopback port; returns the endpoint URL.
    pub async fn serve(self: &Arc<Self>, shutdown: CancellationToken) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(
            listener,
            GrpcServices {
                auth: self.auth.clone(),
                vault: self.vault.clone(),
                metrics: self.metrics.clone(),
                span: Span::none(),
            },
            Duration::from_secs(10),
            shutdown,
        ));
        endpoint
    }
}

fn rejected(e: ServiceError) -> RemoteError {
    RemoteError::rejected(e.kind(), e.to_string())
}

/// Calls the lbxd services directly, skipping the transport. Each device gets
/// its own handle so it can be taken offline on its own.
#[derive(Clone)]
pub struct DirectRemote {
    backend: Arc<Backend>,
    offline: Arc<AtomicBool>,
}

impl DirectRemote {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self {
            backend,
            offline: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn reachable(&self) -> RemoteResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::rejected(ErrorKind::Unavailable, "device offline"));
        }
        Ok(())
    }

    fn session(&self, token: &str) -> RemoteResult<String> {
        self.reachable()?;
        Ok(self.backend.auth.authenticate(token).map_err(rejected)?.email)
    }
}

impl VaultRemote for DirectRemote {
    async fn register(&self, email: &str, auth_hash: &AuthHash) -> RemoteResult<()> {
        self.reachable()?;
        self.backend
            .auth
            .register(email, auth_hash.as_bytes())
            .map_err(rejected)
    }

    async fn login(&self, email: &str, auth_hash: &AuthHash, email_code: Option<&str>) -> RemoteResult<String> {
        self.reachable()?;
        self.backend
            .auth
            .login(email, auth_hash.as_bytes(), email_code)
            .map_err(rejected)
    }

    async fn list_vault_items(&self, token: &str, since: Option<i64>) -> RemoteResult<Vec<VaultItem>> {
        let email = self.session(token)?;
        self.backend.vault.list_vault_items(&email, since).map_err(rejected)
    }

    async fn set_vault_item(&self, token: &str, item: VaultItem) -> RemoteResult<SetResult> {
        let email = self.session(token)?;
        let value = item.value.clone();
        let outcome = self.backend.vault.set_vault_item(&email, item).map_err(rejected)?;
        self.backend.accepted.lock().unwrap().push((outcome.id.clone(), value));
        Ok(SetResult {
            id: outcome.id,
            version: outcome.version,
        })
    }

    async fn logout(&self, token: &str) -> RemoteResult<()> {
        self.reachable()?;
        let session = self.backend.auth.authenticate(token).map_err(rejected)?;
        self.backend.auth.logout(&session).map_err(rejected)
    }
}

pub fn device<R: VaultRemote>(remote: R) -> VaultClient<R> {
    VaultClient::new(
        remote,
        Arc::new(SqliteLocalStore::in_memory().unwrap()),
        fast_kdf(),
        Span::none(),
    )
}

/// Register `email`, then log in with the mailed code.
pub async fn sign_up<R: VaultRemote>(client: &VaultClient<R>, backend: &Backend, email: &str) {
    client.register(email, secret(PASSWORD)).await.unwrap();
    let err = client.login(email, secret(PASSWORD)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UserEmailNotVerified);
    client.verify_email(&backend.code_for(email)).await.unwrap();
}
