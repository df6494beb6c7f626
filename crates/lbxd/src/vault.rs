//! Vault write path and change listing.
//!
//! Writes are compare-and-swap on `server_updated_at`; the store applies the
//! version check and the write as one statement. A per-user last-mutation
//! cache lets idle polls return without touching the store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lbx_core::{now_micros, VaultItem};
use lbx_storage::{KvCache, ServerStore, StorageError};
use tracing::Span;

use crate::error::{ServiceError, ServiceResult};
use crate::metrics::ServerMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOutcome {
    /// Canonical item id (assigned by the server if the request had none)
    pub id: String,
    pub version: i64,
}

pub struct VaultService {
    store: Arc<dyn ServerStore>,
    last_mutation: Arc<dyn KvCache>,
    // serializes read-compare-set on last_mutation
    last_mutation_guard: Mutex<()>,
    last_mutation_ttl: Duration,
    max_value_bytes: usize,
    metrics: ServerMetrics,
    span: Span,
}

impl VaultService {
    pub fn new(
        store: Arc<dyn ServerStore>,
        last_mutation: Arc<dyn KvCache>,
        last_mutation_ttl: Duration,
        max_value_bytes: usize,
        metrics: ServerMetrics,
        span: Span,
    ) -> Self {
        Self {
            store,
            last_mutation,
            last_mutation_guard: Mutex::new(()),
            last_mutation_ttl,
            max_value_bytes,
            metrics,
            span,
        }
    }

    /// Store `item` if `item.server_updated_at` is still the current version.
    pub fn set_vault_item(&self, email: &str, mut item: VaultItem) -> ServiceResult<SetOutcome> {
        if item.value.len() > self.max_value_bytes {
            return Err(ServiceError::ValueTooBig {
                size: item.value.len(),
                limit: self.max_value_bytes,
            });
        }
        if item.id.is_empty() {
            item.id = uuid::Uuid::new_v4().to_string();
        }

        let expected = item.server_updated_at;
        item.server_updated_at = now_micros().max(expected.saturating_add(1));
        item.client_updated_at = item.server_updated_at;

        let version = match self.store.compare_and_set_item(email, &item, expected) {
            Ok(version) => version,
            Err(StorageError::VersionConflict { .. }) => {
                self.metrics.version_conflict();
                tracing::debug!(parent: &self.span, email, id = %item.id, expected, "version conflict");
                return Err(ServiceError::VersionConflict { id: item.id });
            }
            Err(e) => return Err(ServiceError::storage("set vault item")(e)),
        };

        self.raise_last_mutation(email, version);
        tracing::debug!(parent: &self.span, email, id = %item.id, version, "vault item stored");
        Ok(SetOutcome { id: item.id, version })
    }

    /// Items changed after `since` (all items when `None`), oldest first.
    pub fn list_vault_items(&self, email: &str, since: Option<i64>) -> ServiceResult<Vec<VaultItem>> {
        if let Some(since) = since {
            if let Some(last) = self.cached_last_mutation(email) {
                if last <= since {
                    self.metrics.list_short_circuit();
                    return Ok(Vec::new());
                }
            }
        }

        let items = self
            .store
            .list_vault_items(email, since)
            .map_err(ServiceError::storage("list vault items"))?;

        let newest = items
            .iter()
            .map(|item| item.server_updated_at)
            .chain(since)
            .max();
        if let Some(newest) = newest {
            self.raise_last_mutation(email, newest);
        }
        Ok(items)
    }

    fn cached_last_mutation(&self, email: &str) -> Option<i64> {
        match self.last_mutation.get(email) {
            Ok(value) => value.and_then(|v| v.parse().ok()),
            Err(e) => {
                tracing::warn!(parent: &self.span, email, error = %e, "last-mutation cache read failed");
                None
            }
        }
    }

    /// Move the cached last-mutation time forward, never backward.
    fn raise_last_mutation(&self, email: &str, version: i64) {
        let Ok(_guard) = self.last_mutation_guard.lock() else {
            self.forget_last_mutation(email);
            return;
        };
        if self.cached_last_mutation(email).is_some_and(|current| current >= version) {
            return;
        }
        if let Err(e) = self
            .last_mutation
            .set(email, &version.to_string(), self.last_mutation_ttl)
        {
            tracing::warn!(parent: &self.span, email, error = %e, "last-mutation cache write failed");
            self.forget_last_mutation(email);
        }
    }

    // A stale entry would hide changes from pollers; dropping it only costs a query.
    fn forget_last_mutation(&self, email: &str) {
        if let Err(e) = self.last_mutation.delete(email) {
            tracing::error!(parent: &self.span, email, error = %e, "last-mutation cache unusable");
        }
    }
}
