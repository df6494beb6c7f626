//! tonic gRPC server: account and vault services over TCP
//!
//! Vault calls pass through [`AuthInterceptor`], which resolves the `token`
//! metadata entry to a [`Session`] stored in the request extensions. Service
//! operations touch SQLite and Argon2, so handlers run them on the blocking
//! pool. Errors leave as `tonic::Status` with the error kind attached.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lbx_core::status::{to_status, TOKEN_KEY};
use lbx_core::{ErrorKind, VaultItem};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::service::Interceptor;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::Span;

use lbx_core::proto::{
    user_service_server::{UserService, UserServiceServer},
    vault_service_server::{VaultService as VaultRpc, VaultServiceServer},
    ListVaultItemsRequest, ListVaultItemsResponse, LoginRequest, LoginResponse, LogoutRequest,
    LogoutResponse, RegisterRequest, RegisterResponse, SetVaultItemRequest, SetVaultItemResponse,
};

use crate::auth::{AuthService, Session};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics::ServerMetrics;
use crate::vault::VaultService;

/// Shared outcome handling for every RPC.
#[derive(Clone)]
struct Calls {
    metrics: ServerMetrics,
    span: Span,
}

impl Calls {
    async fn blocking<T, F>(&self, method: &'static str, f: F) -> Result<T, Status>
    where
        F: FnOnce() -> ServiceResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = match tokio::task::spawn_blocking(f).await {
            Ok(result) => result,
            Err(e) => Err(ServiceError::internal("join blocking task", e)),
        };
        self.finish(method, result)
    }

    fn finish<T>(&self, method: &'static str, result: ServiceResult<T>) -> Result<T, Status> {
        match result {
            Ok(value) => {
                self.metrics.rpc(method, "ok");
                Ok(value)
            }
            Err(err) => {
                let kind = err.kind();
                self.metrics.rpc(method, kind.as_str());
                if kind == ErrorKind::Internal {
                    tracing::error!(parent: &self.span, method, error = %err, "request failed");
                } else {
                    tracing::debug!(parent: &self.span, method, kind = %kind, "request rejected");
                }
                Err(to_status(kind, err.to_string()))
            }
        }
    }
}

// ── Interceptor ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AuthInterceptor {
    auth: Arc<AuthService>,
    calls: Calls,
}

impl AuthInterceptor {
    fn resolve(&self, request: &Request<()>) -> ServiceResult<Session> {
        let token = request
            .metadata()
            .get(TOKEN_KEY)
            .ok_or(ServiceError::NeedAuthentication)?
            .to_str()
            .map_err(|_| ServiceError::InvalidToken)?;
        self.auth.authenticate(token)
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        match self.resolve(&request) {
            Ok(session) => {
                request.extensions_mut().insert(session);
                Ok(request)
            }
            Err(err) => self.calls.finish("authenticate", Err(err)),
        }
    }
}

// ── Services ─────────────────────────────────────────────────────────────────

pub struct UserGrpc {
    auth: Arc<AuthService>,
    calls: Calls,
}

#[tonic::async_trait]
impl UserService for UserGrpc {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<RegisterResponse>, Status> {
        let req = request.into_inner();
        let auth = self.auth.clone();
        self.calls
            .blocking("register", move || auth.register(&req.email, &req.auth_hash))
            .await?;
        Ok(Response::new(RegisterResponse {}))
    }

    async fn login(&self, request: Request<LoginRequest>) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        let auth = self.auth.clone();
        let token = self
            .calls
            .blocking("login", move || {
                auth.login(&req.email, &req.auth_hash, req.email_code.as_deref())
            })
            .await?;
        Ok(Response::new(LoginResponse { token }))
    }
}

pub struct VaultGrpc {
    auth: Arc<AuthService>,
    vault: Arc<VaultService>,
    calls: Calls,
}

fn session_of<T>(request: &Request<T>) -> ServiceResult<Session> {
    request
        .extensions()
        .get::<Session>()
        .cloned()
        .ok_or(ServiceError::NeedAuthentication)
}

#[tonic::async_trait]
impl VaultRpc for VaultGrpc {
    async fn list_vault_items(
        &self,
        request: Request<ListVaultItemsRequest>,
    ) -> Result<Response<ListVaultItemsResponse>, Status> {
        let session = session_of(&request);
        let since = request.into_inner().since;
        let vault = self.vault.clone();
        let items = self
            .calls
            .blocking("list_vault_items", move || {
                vault.list_vault_items(&session?.email, since)
            })
            .await?;
        Ok(Response::new(ListVaultItemsResponse {
            items: items.into_iter().map(Into::into).collect(),
        }))
    }

    async fn set_vault_item(
        &self,
        request: Request<SetVaultItemRequest>,
    ) -> Result<Response<SetVaultItemResponse>, Status> {
        let session = session_of(&request);
        let item = request.into_inner().item;
        let vault = self.vault.clone();
        let outcome = self
            .calls
            .blocking("set_vault_item", move || {
                let session = session?;
                let item = item.ok_or_else(|| ServiceError::InvalidArgument("missing item".into()))?;
                let item = VaultItem::try_from(item)
                    .map_err(|e| ServiceError::InvalidArgument(e.to_string()))?;
                vault.set_vault_item(&session.email, item)
            })
            .await?;
        Ok(Response::new(SetVaultItemResponse {
            id: outcome.id,
            server_updated_at: outcome.version,
        }))
    }

    async fn logout(&self, request: Request<LogoutRequest>) -> Result<Response<LogoutResponse>, Status> {
        let session = session_of(&request);
        let auth = self.auth.clone();
        self.calls
            .blocking("logout", move || auth.logout(&session?))
            .await?;
        Ok(Response::new(LogoutResponse {}))
    }
}

// ── Server ───────────────────────────────────────────────────────────────────

pub struct GrpcServices {
    pub auth: Arc<AuthService>,
    pub vault: Arc<VaultService>,
    pub metrics: ServerMetrics,
    pub span: Span,
}

/// Serve both services on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    services: GrpcServices,
    request_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    let span = services.span.clone();
    let calls = Calls {
        metrics: services.metrics,
        span: services.span.clone(),
    };

    let users = UserServiceServer::new(UserGrpc {
        auth: services.auth.clone(),
        calls: calls.clone(),
    });
    let vault = VaultServiceServer::with_interceptor(
        VaultGrpc {
            auth: services.auth.clone(),
            vault: services.vault,
            calls: calls.clone(),
        },
        AuthInterceptor {
            auth: services.auth,
            calls,
        },
    );

    tracing::info!(parent: &span, addr = %addr, "gRPC server ready");

    Server::builder()
        .timeout(request_timeout)
        .add_service(users)
        .add_service(vault)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .map_err(|e| anyhow::anyhow!("gRPC server error: {e}"))
}
