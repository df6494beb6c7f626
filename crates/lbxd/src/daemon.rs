//! Daemon lifecycle: store, caches, mail workers, metrics, gRPC server

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lbx_core::config::ServerConfig;
use lbx_crypto::TokenSigner;
use lbx_storage::{MemoryCache, ServerStore, SqliteServerStore};
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Span};

use crate::auth::{AuthService, AuthSettings};
use crate::grpc::{self, GrpcServices};
use crate::mail::{LogMailSender, VerificationMailer};
use crate::metrics::{self, HealthState, ServerMetrics};
use crate::queue::{local_queue, run_workers, PoolSettings};
use crate::vault::VaultService;

pub async fn run(config: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let span = info_span!("lbxd");
    info!(parent: &span, "daemon starting");

    let secret = config
        .auth
        .token_secret
        .as_deref()
        .context("no token secret: set LBXD_TOKEN_SECRET or auth.token_secret")?;
    let signer = TokenSigner::new(secret.as_bytes()).context("token secret")?;

    // ── Store ────────────────────────────────────────────────────────────
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store: Arc<dyn ServerStore> = Arc::new(
        SqliteServerStore::open(db_path, Duration::from_millis(config.storage.busy_timeout_ms))
            .with_context(|| format!("opening server store {}", db_path.display()))?,
    );
    info!(parent: &span, path = %db_path.display(), "server store opened");

    let sessions = Arc::new(MemoryCache::new());
    let email_codes = Arc::new(MemoryCache::new());
    let last_mutation = Arc::new(MemoryCache::new());

    let mut registry = Registry::default();
    let metrics = ServerMetrics::new(&mut registry);

    // ── Mail workers ─────────────────────────────────────────────────────
    let (queue, jobs) = local_queue();
    let mail_span = info_span!(parent: &span, "mail");
    let mailer = Arc::new(VerificationMailer::new(
        LogMailSender::new(mail_span.clone()),
        email_codes.clone(),
        &config.mail,
        mail_span.clone(),
    ));
    let workers = tokio::spawn(run_workers(
        jobs,
        queue.clone(),
        mailer,
        PoolSettings {
            workers: config.mail.workers,
            max_retries: config.mail.max_retries,
        },
        metrics.clone(),
        shutdown.clone(),
        mail_span,
    ));

    let evictor = tokio::spawn(evict_expired(
        vec![sessions.clone(), email_codes.clone(), last_mutation.clone()],
        Duration::from_secs(config.auth.cache_evict_interval_secs.max(1)),
        shutdown.clone(),
        span.clone(),
    ));

    // ── Metrics ──────────────────────────────────────────────────────────
    if let Some(addr) = config.server.metrics_addr.clone() {
        let state = HealthState {
            registry: Arc::new(registry),
            store: store.clone(),
        };
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, state, token).await {
                error!("metrics server failed: {e}");
            }
        });
    }

    // ── gRPC ─────────────────────────────────────────────────────────────
    let auth = Arc::new(AuthService::new(
        store.clone(),
        sessions,
        email_codes,
        Arc::new(queue),
        signer,
        AuthSettings::from_config(&config),
        info_span!(parent: &span, "auth"),
    ));
    let vault = Arc::new(VaultService::new(
        store,
        last_mutation,
        Duration::from_secs(config.auth.last_mutation_ttl_secs),
        config.storage.max_item_value_bytes,
        metrics.clone(),
        info_span!(parent: &span, "vault"),
    ));

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;

    let result = grpc::serve(
        listener,
        GrpcServices {
            auth,
            vault,
            metrics,
            span: info_span!(parent: &span, "grpc"),
        },
        Duration::from_secs(config.server.request_timeout_secs),
        shutdown.clone(),
    )
    .await;

    // The server may also stop on its own; take the background tasks down with it.
    shutdown.cancel();
    let _ = workers.await;
    let _ = evictor.await;
    info!(parent: &span, "daemon stopped");
    result
}

async fn evict_expired(
    caches: Vec<Arc<MemoryCache>>,
    every: Duration,
    shutdown: CancellationToken,
    span: Span,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted: usize = caches.iter().map(|c| c.evict_expired()).sum();
                if evicted > 0 {
                    tracing::debug!(parent: &span, evicted, "expired cache entries dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbx_storage::KvCache;

    #[tokio::test]
    async fn test_missing_secret_fails_fast() {
        let err = run(ServerConfig::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("token secret"));
    }

    #[tokio::test]
    async fn test_short_secret_rejected() {
        let mut config = ServerConfig::default();
        config.auth.token_secret = Some("short".into());
        assert!(run(config, CancellationToken::new()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evictor_sweeps_until_cancelled() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("k", "v", Duration::ZERO).unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(evict_expired(
            vec![cache.clone()],
            Duration::from_secs(60),
            shutdown.clone(),
            Span::none(),
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty());
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.auth.token_secret = Some("0123456789abcdef0123".into());
        config.server.listen = "127.0.0.1:0".into();
        config.server.metrics_addr = None;
        config.storage.db_path = dir.path().join("db/lbxd.db");

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run(config, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(dir.path().join("db/lbxd.db").exists());
    }
}
