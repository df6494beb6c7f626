//! Background sync loop: one bounded cycle per tick until cancelled.

use std::time::Duration;

use lbx_core::config::SyncConfig;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, Span};

use crate::engine::{SyncEngine, SyncError, SyncReport};
use crate::remote::VaultRemote;

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub interval: Duration,
    /// Upper bound for one cycle; an overrunning cycle is dropped
    pub cycle_timeout: Duration,
}

impl ScheduleSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            cycle_timeout: Duration::from_secs(config.cycle_timeout_secs.max(1)),
        }
    }
}

/// Sync immediately, then every `interval`, until `shutdown` is cancelled.
///
/// Ticks missed while a cycle runs are delayed, not bunched. Each finished
/// (or timed out) cycle is handed to `on_cycle`. Cancellation interrupts a
/// running cycle; local writes are per item, so that leaves the store
/// consistent.
pub async fn run_scheduler<R, F>(
    engine: &SyncEngine<R>,
    settings: &ScheduleSettings,
    shutdown: CancellationToken,
    mut on_cycle: F,
    span: Span,
) where
    R: VaultRemote,
    F: FnMut(&Result<SyncReport, SyncError>),
{
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(parent: &span, interval = ?settings.interval, "sync scheduler started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = tokio::time::timeout(settings.cycle_timeout, engine.sync_cycle()) => {
                result.unwrap_or_else(|_| Err(SyncError::TimedOut(settings.cycle_timeout)))
            }
        };
        if let Err(e) = &result {
            tracing::warn!(parent: &span, error = %e, "sync cycle did not complete");
        }
        on_cycle(&result);
    }

    info!(parent: &span, "sync scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyncOutcome;
    use crate::remote::testing::MemoryRemote;
    use crate::remote::{RemoteResult, SetResult};
    use lbx_core::VaultItem;
    use lbx_crypto::AuthHash;
    use lbx_storage::{CredentialStore, SqliteLocalStore};
    use std::sync::Arc;

    /// Accepts every call and never answers.
    struct StalledRemote;

    impl VaultRemote for StalledRemote {
        async fn register(&self, _: &str, _: &AuthHash) -> RemoteResult<()> {
            std::future::pending().await
        }
        async fn login(&self, _: &str, _: &AuthHash, _: Option<&str>) -> RemoteResult<String> {
            std::future::pending().await
        }
        async fn list_vault_items(&self, _: &str, _: Option<i64>) -> RemoteResult<Vec<VaultItem>> {
            std::future::pending().await
        }
        async fn set_vault_item(&self, _: &str, _: VaultItem) -> RemoteResult<SetResult> {
            std::future::pending().await
        }
        async fn logout(&self, _: &str) -> RemoteResult<()> {
            std::future::pending().await
        }
    }

    fn store_with_token() -> Arc<SqliteLocalStore> {
        let store = Arc::new(SqliteLocalStore::in_memory().unwrap());
        store.set_token("tok").unwrap();
        store
    }

    fn settings(interval: u64, timeout: u64) -> ScheduleSettings {
        ScheduleSettings {
            interval: Duration::from_secs(interval),
            cycle_timeout: Duration::from_secs(timeout),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_on_every_tick() {
        let engine = SyncEngine::new(MemoryRemote::new(), store_with_token(), Span::none());
        let shutdown = CancellationToken::new();
        let mut outcomes = Vec::new();

        let stop = async {
            tokio::time::sleep(Duration::from_secs(185)).await;
            shutdown.cancel();
        };
        let sched = settings(60, 5);
        tokio::join!(
            run_scheduler(
                &engine,
                &sched,
                shutdown.clone(),
                |r| outcomes.push(r.as_ref().map(|r| r.outcome).ok()),
                Span::none(),
            ),
            stop
        );

        // t = 0, 60, 120, 180; the unknown token ends each cycle as NeedsLogin
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0], Some(SyncOutcome::NeedsLogin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_cycle_times_out() {
        let engine = SyncEngine::new(StalledRemote, store_with_token(), Span::none());
        let shutdown = CancellationToken::new();
        let mut timeouts = 0;

        let stop = async {
            tokio::time::sleep(Duration::from_secs(70)).await;
            shutdown.cancel();
        };
        let sched = settings(60, 5);
        tokio::join!(
            run_scheduler(
                &engine,
                &sched,
                shutdown.clone(),
                |r| {
                    if matches!(r, Err(SyncError::TimedOut(_))) {
                        timeouts += 1;
                    }
                },
                Span::none(),
            ),
            stop
        );

        // t = 0..5 and t = 60..65
        assert_eq!(timeouts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_running_cycle() {
        let engine = SyncEngine::new(StalledRemote, store_with_token(), Span::none());
        let shutdown = CancellationToken::new();
        let mut cycles = 0;

        let stop = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            shutdown.cancel();
        };
        let sched = settings(60, 3600);
        tokio::join!(
            run_scheduler(&engine, &sched, shutdown.clone(), |_| cycles += 1, Span::none()),
            stop
        );
        assert_eq!(cycles, 0);
    }

    #[test]
    fn test_zero_config_values_are_clamped() {
        let s = ScheduleSettings::from_config(&SyncConfig {
            interval_secs: 0,
            cycle_timeout_secs: 0,
        });
        assert_eq!(s.interval, Duration::from_secs(1));
        assert_eq!(s.cycle_timeout, Duration::from_secs(1));
    }
}
