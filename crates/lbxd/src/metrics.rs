//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness probe (always 200 if process is running)
//!   GET /readyz   Readiness probe (200 if the server store answers)

use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use lbx_storage::ServerStore;
use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tokio_util::sync::CancellationToken;

type Labels = Vec<(String, String)>;

/// Counters shared by the RPC layer, the vault service and the mail workers.
///
/// `Default` gives a detached set, useful in tests; [`ServerMetrics::new`]
/// registers the same handles with a registry.
#[derive(Clone, Default)]
pub struct ServerMetrics {
    rpc_requests: Family<Labels, Counter>,
    version_conflicts: Counter,
    list_short_circuits: Counter,
    mail_jobs: Family<Labels, Counter>,
}

impl ServerMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "lbxd_rpc_requests",
            "RPC requests by method and outcome",
            metrics.rpc_requests.clone(),
        );
        registry.register(
            "lbxd_vault_version_conflicts",
            "SetVaultItem calls rejected by the version check",
            metrics.version_conflicts.clone(),
        );
        registry.register(
            "lbxd_vault_list_short_circuits",
            "ListVaultItems calls answered from the last-mutation cache",
            metrics.list_short_circuits.clone(),
        );
        registry.register(
            "lbxd_mail_jobs",
            "Verification mail jobs by outcome",
            metrics.mail_jobs.clone(),
        );
        metrics
    }

    pub fn rpc(&self, method: &str, outcome: &str) {
        self.rpc_requests
            .get_or_create(&vec![
                ("method".to_string(), method.to_string()),
                ("outcome".to_string(), outcome.to_string()),
            ])
            .inc();
    }

    pub fn version_conflict(&self) {
        self.version_conflicts.inc();
    }

    pub fn list_short_circuit(&self) {
        self.list_short_circuits.inc();
    }

    pub fn mail_job(&self, outcome: &str) {
        self.mail_jobs
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .inc();
    }

    pub fn version_conflicts(&self) -> u64 {
        self.version_conflicts.get()
    }

    pub fn list_short_circuits(&self) -> u64 {
        self.list_short_circuits.get()
    }

    pub fn mail_jobs(&self, outcome: &str) -> u64 {
        self.mail_jobs
            .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
            .get()
    }
}

/// Shared state of the health endpoints
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub store: Arc<dyn ServerStore>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

/// Serve metrics and health endpoints on `addr` until `shutdown` fires.
pub async fn serve(addr: String, state: HealthState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.ping()).await {
        Ok(Ok(())) => (StatusCode::OK, "ready"),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "readiness: store ping failed");
            (StatusCode::SERVICE_UNAVAILABLE, "store unreachable")
        }
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "store unreachable"),
    }
}
