//! Sync engine: one cycle = pull, then push.
//!
//! Pull lists everything the server changed after the stored watermark and
//! applies it oldest first. A dirty local row that the incoming version
//! overtakes goes to the conflict shelf before being replaced; that is the
//! only place conflicts are resolved.
//!
//! Push sends dirty rows oldest server version first with their known
//! version as the expected one. A version conflict ends the push for this
//! cycle; the next pull brings the newer server row and shelves our edit.
//!
//! Auth failures clear the stored token and end the cycle as `NeedsLogin`.
//! An unreachable server ends it as `Offline`. Neither is an error.
//!
//! [`SyncEngine::push_edit`] sends a single fresh edit outside the cycle,
//! with the same conflict and auth handling.

use std::sync::Arc;

use lbx_core::VaultItem;
use lbx_storage::{CredentialStore, RemoteApply, StorageError, VaultStore};
use thiserror::Error;
use tracing::{debug, info, warn, Span};

use crate::remote::{RemoteError, VaultRemote};

/// Everything the engine and the client need from local storage.
pub trait LocalStore: VaultStore + CredentialStore {}

impl<T: VaultStore + CredentialStore> LocalStore for T {}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("{op}: {source}")]
    Remote {
        op: &'static str,
        #[source]
        source: RemoteError,
    },

    #[error("sync cycle timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

impl SyncError {
    pub(crate) fn storage(op: &'static str) -> impl FnOnce(StorageError) -> SyncError {
        move |source| SyncError::Storage { op, source }
    }

    pub(crate) fn remote(op: &'static str) -> impl FnOnce(RemoteError) -> SyncError {
        move |source| SyncError::Remote { op, source }
    }

    pub fn kind(&self) -> lbx_core::ErrorKind {
        match self {
            SyncError::Storage { .. } => lbx_core::ErrorKind::Internal,
            SyncError::Remote { source, .. } => source.kind(),
            SyncError::TimedOut(_) => lbx_core::ErrorKind::Unavailable,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncOutcome {
    #[default]
    Completed,
    /// A push hit a newer server version; the rest waits for the next cycle.
    PushConflict,
    /// No usable session token.
    NeedsLogin,
    Offline,
}

/// What happened to an edit pushed on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditPush {
    /// Acknowledged; the row is clean under this (possibly server-assigned) id.
    Pushed { id: String },
    /// The server holds a newer version; the next pull shelves the edit.
    Deferred,
    /// No session token, or the server rejected it.
    NeedsLogin,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Pulled items that changed the local row
    pub pulled: usize,
    /// Local edits moved to the conflict shelf
    pub conflicts: usize,
    pub pushed: usize,
    pub outcome: SyncOutcome,
}

pub struct SyncEngine<R> {
    remote: R,
    store: Arc<dyn LocalStore>,
    span: Span,
}

impl<R: VaultRemote> SyncEngine<R> {
    pub fn new(remote: R, store: Arc<dyn LocalStore>, span: Span) -> Self {
        Self {
            remote,
            store,
            span,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Run one pull + push cycle.
    ///
    /// Dropping the future between items is safe: every local write is its
    /// own transaction and the watermark only covers applied items.
    pub async fn sync_cycle(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        let Some(token) = self
            .store
            .token()
            .map_err(SyncError::storage("read session token"))?
        else {
            debug!(parent: &self.span, "no session token, sync skipped");
            report.outcome = SyncOutcome::NeedsLogin;
            return Ok(report);
        };

        let result = match self.pull(&token, &mut report).await {
            Ok(()) => self.push(&token, &mut report).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {}
            Err(SyncError::Remote { op, source }) if source.is_auth_failure() => {
                info!(parent: &self.span, op, kind = %source.kind(), "session rejected, login required");
                self.store
                    .clear_token()
                    .map_err(SyncError::storage("clear session token"))?;
                report.outcome = SyncOutcome::NeedsLogin;
            }
            Err(SyncError::Remote { op, source }) if source.is_unavailable() => {
                debug!(parent: &self.span, op, error = %source, "server unavailable");
                report.outcome = SyncOutcome::Offline;
            }
            Err(e) => {
                warn!(parent: &self.span, error = %e, "sync cycle failed");
                return Err(e);
            }
        }

        info!(
            parent: &self.span,
            pulled = report.pulled,
            conflicts = report.conflicts,
            pushed = report.pushed,
            outcome = ?report.outcome,
            "sync cycle finished"
        );
        Ok(report)
    }

    async fn pull(&self, token: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        let watermark = self
            .store
            .pull_watermark()
            .map_err(SyncError::storage("read pull watermark"))?;
        let since = (watermark > 0).then_some(watermark);

        let mut items = self
            .remote
            .list_vault_items(token, since)
            .await
            .map_err(SyncError::remote("list vault items"))?;
        items.sort_by_key(|item| item.server_updated_at);

        for mut incoming in items {
            // a pulled row is clean by definition
            incoming.client_updated_at = incoming.server_updated_at;
            let version = incoming.server_updated_at;
            let outcome = self
                .store
                .apply_remote(&incoming, &|local| {
                    local.is_dirty() && version > local.server_updated_at
                })
                .map_err(SyncError::storage("apply pulled item"))?;

            match outcome {
                RemoteApply::Unchanged => {}
                RemoteApply::Replaced => report.pulled += 1,
                RemoteApply::Shelved => {
                    report.pulled += 1;
                    report.conflicts += 1;
                    warn!(parent: &self.span, id = %incoming.id, version, "local edit moved to conflict shelf");
                }
            }
        }
        Ok(())
    }

    async fn push(&self, token: &str, report: &mut SyncReport) -> Result<(), SyncError> {
        let dirty = self
            .store
            .list_dirty()
            .map_err(SyncError::storage("list dirty items"))?;

        for item in dirty {
            let id = item.id.clone();
            let expected = item.server_updated_at;

            match self.send(token, item).await {
                Ok(_) => report.pushed += 1,
                Err(SyncError::Remote { source, .. }) if source.is_conflict() => {
                    info!(parent: &self.span, id = %id, expected, "push conflict, deferring to next pull");
                    report.outcome = SyncOutcome::PushConflict;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Push the local row `id` now, if it carries an edit and a session
    /// token is stored.
    ///
    /// Conflicts, auth failures and an unreachable server leave the row dirty
    /// for the next cycle and are reported, not returned as errors; an auth
    /// failure also clears the token. Other server rejections are errors.
    pub async fn push_edit(&self, id: &str) -> Result<EditPush, SyncError> {
        let Some(token) = self
            .store
            .token()
            .map_err(SyncError::storage("read session token"))?
        else {
            return Ok(EditPush::NeedsLogin);
        };
        let item = self
            .store
            .get_item(id)
            .map_err(SyncError::storage("read item"))?;
        let item = match item {
            Some(item) if item.is_dirty() => item,
            _ => return Ok(EditPush::Pushed { id: id.to_string() }),
        };
        let expected = item.server_updated_at;

        match self.send(&token, item).await {
            Ok(id) => Ok(EditPush::Pushed { id }),
            Err(SyncError::Remote { source, .. }) if source.is_conflict() => {
                info!(parent: &self.span, id, expected, "push conflict, deferring to next pull");
                Ok(EditPush::Deferred)
            }
            Err(SyncError::Remote { op, source }) if source.is_auth_failure() => {
                info!(parent: &self.span, op, kind = %source.kind(), "session rejected, login required");
                self.store
                    .clear_token()
                    .map_err(SyncError::storage("clear session token"))?;
                Ok(EditPush::NeedsLogin)
            }
            Err(SyncError::Remote { op, source }) if source.is_unavailable() => {
                debug!(parent: &self.span, op, error = %source, "server unavailable, edit kept local");
                Ok(EditPush::Offline)
            }
            Err(e) => Err(e),
        }
    }

    /// Set one item on the server and record the acknowledgement. Returns
    /// the canonical id.
    async fn send(&self, token: &str, item: VaultItem) -> Result<String, SyncError> {
        let id = item.id.clone();
        let pushed_stamp = item.client_updated_at;
        let ack = self
            .remote
            .set_vault_item(token, item)
            .await
            .map_err(SyncError::remote("set vault item"))?;
        self.store
            .mark_pushed(&id, &ack.id, pushed_stamp, ack.version)
            .map_err(SyncError::storage("record pushed item"))?;
        debug!(parent: &self.span, id = %ack.id, version = ack.version, "item pushed");
        Ok(ack.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::testing::{MemoryRemote, CODE};
    use lbx_core::{ErrorKind, ItemType};
    use lbx_crypto::AuthHash;
    use lbx_storage::{LocalEdit, SqliteLocalStore};

    const EMAIL: &str = "a@x.com";

    struct Harness {
        engine: SyncEngine<Arc<MemoryRemote>>,
        remote: Arc<MemoryRemote>,
        store: Arc<SqliteLocalStore>,
    }

    async fn harness() -> Harness {
        let remote = Arc::new(MemoryRemote::new());
        let hash = AuthHash::from_bytes([1; 32]);
        remote.register(EMAIL, &hash).await.unwrap();
        let token = remote.login(EMAIL, &hash, Some(CODE)).await.unwrap();

        let store = Arc::new(SqliteLocalStore::in_memory().unwrap());
        store.switch_owner(EMAIL).unwrap();
        store.set_token(&token).unwrap();
        Harness {
            engine: SyncEngine::new(remote.clone(), store.clone(), Span::none()),
            remote,
            store,
        }
    }

    fn edit(id: &str, name: &str) -> LocalEdit {
        LocalEdit {
            id: id.into(),
            name: name.into(),
            item_type: ItemType::Text,
            value: name.as_bytes().to_vec(),
            is_deleted: false,
        }
    }

    fn server_item(id: &str, name: &str) -> VaultItem {
        VaultItem {
            id: id.into(),
            name: name.into(),
            item_type: ItemType::Text,
            value: name.as_bytes().to_vec(),
            server_updated_at: 0,
            client_updated_at: 0,
            is_deleted: false,
        }
    }

    #[tokio::test]
    async fn test_push_on_fresh_store() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "first")).unwrap();

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(report.outcome, SyncOutcome::Completed);
        assert!(h.store.list_dirty().unwrap().is_empty());
        assert_eq!(h.remote.item(EMAIL, "1").unwrap().name, "first");
    }

    #[tokio::test]
    async fn test_conflict_preserves_local_edit() {
        let h = harness().await;
        h.remote.write_as_other_device(EMAIL, server_item("1", "base"), 150);
        h.engine.sync_cycle().await.unwrap();
        let local = h.store.apply_local_edit(edit("1", "mine")).unwrap();
        assert_eq!(local.server_updated_at, 150);

        h.remote.write_as_other_device(EMAIL, server_item("1", "theirs"), 200);
        let report = h.engine.sync_cycle().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.pushed, 0);
        assert_eq!(h.store.list_conflicts().unwrap(), vec![local]);

        let current = h.store.get_item("1").unwrap().unwrap();
        assert_eq!(current.name, "theirs");
        assert_eq!(current.server_updated_at, 200);
        assert_eq!(current.client_updated_at, 200);
        assert_eq!(h.remote.item(EMAIL, "1").unwrap().name, "theirs");
    }

    #[tokio::test]
    async fn test_second_cycle_writes_nothing() {
        let h = harness().await;
        h.remote.write_as_other_device(EMAIL, server_item("r", "remote"), 100);
        h.store.apply_local_edit(edit("l", "local")).unwrap();

        let first = h.engine.sync_cycle().await.unwrap();
        assert_eq!((first.pulled, first.pushed), (1, 1));
        let writes = h.remote.writes();
        let items = h.store.list_items().unwrap();

        let second = h.engine.sync_cycle().await.unwrap();
        assert_eq!(second, SyncReport::default());
        assert_eq!(h.remote.writes(), writes);
        assert_eq!(h.store.list_items().unwrap(), items);
        assert!(h.store.list_conflicts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edit_between_cycles_is_not_lost_to_echo() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "v1")).unwrap();
        h.engine.sync_cycle().await.unwrap();
        h.store.apply_local_edit(edit("1", "v2")).unwrap();

        // the pull sees our own v1 again before v2 is pushed
        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.pushed, 1);
        assert_eq!(h.remote.item(EMAIL, "1").unwrap().name, "v2");
        assert_eq!(h.store.get_item("1").unwrap().unwrap().name, "v2");
    }

    #[tokio::test]
    async fn test_writes_between_pull_and_push_are_still_pulled() {
        let h = harness().await;
        h.remote.write_as_other_device(EMAIL, server_item("old", "old"), 10);
        h.engine.sync_cycle().await.unwrap();

        // another device writes, then our push lands with a higher version
        h.remote.write_as_other_device(EMAIL, server_item("other", "x"), 20);
        h.store.apply_local_edit(edit("mine", "y")).unwrap();
        h.store.apply_local_edit(edit("old", "edited")).unwrap();
        let token = h.store.token().unwrap().unwrap();
        for item in h.store.list_dirty().unwrap() {
            let stamp = item.client_updated_at;
            let ack = h.remote.set_vault_item(&token, item).await.unwrap();
            h.store.mark_pushed(&ack.id, &ack.id, stamp, ack.version).unwrap();
        }

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(h.store.get_item("other").unwrap().unwrap().name, "x");
    }

    #[tokio::test]
    async fn test_push_conflict_stops_batch() {
        let h = harness().await;
        for id in ["a", "b"] {
            h.store.apply_local_edit(edit(id, id)).unwrap();
        }
        h.remote.inject_on_set(ErrorKind::VaultItemVersionConflict);

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::PushConflict);
        assert_eq!(report.pushed, 0);
        assert_eq!(h.remote.writes(), 0);
        assert_eq!(h.store.list_dirty().unwrap().len(), 2);

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.pushed, 2);
        assert_eq!(report.outcome, SyncOutcome::Completed);
    }

    #[tokio::test]
    async fn test_auth_failure_on_pull_clears_token() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "x")).unwrap();
        h.remote.revoke_all();

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::NeedsLogin);
        assert!(h.store.token().unwrap().is_none());
        assert_eq!(h.store.list_dirty().unwrap().len(), 1);

        let lists = h.remote.lists();
        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::NeedsLogin);
        assert_eq!(h.remote.lists(), lists);
    }

    #[tokio::test]
    async fn test_auth_failure_on_push_clears_token() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "x")).unwrap();
        h.remote.inject_on_set(ErrorKind::InvalidTokenFormat);

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::NeedsLogin);
        assert!(h.store.token().unwrap().is_none());
        assert_eq!(h.store.list_dirty().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_push_is_returned_and_leaves_state() {
        let h = harness().await;
        h.store.apply_local_edit(edit("a", "a")).unwrap();
        h.engine.sync_cycle().await.unwrap();
        h.store.apply_local_edit(edit("b", "b")).unwrap();
        h.store.apply_local_edit(edit("c", "c")).unwrap();
        h.remote.inject_on_set(ErrorKind::VaultItemValueTooBig);

        let err = h.engine.sync_cycle().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VaultItemValueTooBig);
        assert!(h.store.token().unwrap().is_some());
        assert_eq!(h.store.list_dirty().unwrap().len(), 2);
        assert!(!h.store.get_item("a").unwrap().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_offline_is_not_an_error() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "x")).unwrap();
        h.remote.set_offline(true);

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::Offline);
        assert!(h.store.token().unwrap().is_some());
        assert_eq!(h.store.list_dirty().unwrap().len(), 1);

        h.remote.set_offline(false);
        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.pushed, 1);
    }

    #[tokio::test]
    async fn test_internal_error_propagates_with_kind() {
        let h = harness().await;
        h.remote.inject(ErrorKind::Internal);
        let err = h.engine.sync_cycle().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(h.store.token().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_no_token_needs_login() {
        let h = harness().await;
        h.store.clear_token().unwrap();
        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.outcome, SyncOutcome::NeedsLogin);
        assert_eq!(h.remote.lists(), 0);
    }

    #[tokio::test]
    async fn test_tombstone_is_pushed() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "x")).unwrap();
        h.engine.sync_cycle().await.unwrap();

        h.store
            .apply_local_edit(LocalEdit {
                is_deleted: true,
                ..edit("1", "")
            })
            .unwrap();
        h.engine.sync_cycle().await.unwrap();
        let remote = h.remote.item(EMAIL, "1").unwrap();
        assert!(remote.is_deleted);
        assert!(remote.value.is_empty());
    }

    #[tokio::test]
    async fn test_server_assigned_id_rekeys_row() {
        let h = harness().await;
        h.store.apply_local_edit(edit("", "anonymous")).unwrap();
        h.engine.sync_cycle().await.unwrap();

        assert!(h.store.get_item("").unwrap().is_none());
        let items = h.store.list_items().unwrap();
        assert_eq!(items.len(), 1);
        assert!(uuid::Uuid::parse_str(&items[0].id).is_ok());
    }

    #[tokio::test]
    async fn test_push_edit_cleans_row() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "now")).unwrap();

        let pushed = h.engine.push_edit("1").await.unwrap();
        assert_eq!(pushed, EditPush::Pushed { id: "1".into() });
        let local = h.store.get_item("1").unwrap().unwrap();
        assert!(!local.is_dirty());
        assert_eq!(local.server_updated_at, h.remote.item(EMAIL, "1").unwrap().server_updated_at);
        assert_eq!(h.remote.writes(), 1);

        // already clean: nothing sent
        h.engine.push_edit("1").await.unwrap();
        assert_eq!(h.remote.writes(), 1);
    }

    #[tokio::test]
    async fn test_push_edit_offline_keeps_row_dirty() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "later")).unwrap();
        h.remote.set_offline(true);

        assert_eq!(h.engine.push_edit("1").await.unwrap(), EditPush::Offline);
        assert!(h.store.get_item("1").unwrap().unwrap().is_dirty());
        assert!(h.store.token().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_push_edit_conflict_defers_to_pull() {
        let h = harness().await;
        h.remote.write_as_other_device(EMAIL, server_item("1", "base"), 150);
        h.engine.sync_cycle().await.unwrap();
        h.remote.write_as_other_device(EMAIL, server_item("1", "theirs"), 200);
        let mine = h.store.apply_local_edit(edit("1", "mine")).unwrap();

        assert_eq!(h.engine.push_edit("1").await.unwrap(), EditPush::Deferred);
        assert!(h.store.get_item("1").unwrap().unwrap().is_dirty());

        let report = h.engine.sync_cycle().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(h.store.list_conflicts().unwrap(), vec![mine]);
    }

    #[tokio::test]
    async fn test_push_edit_auth_failure_clears_token() {
        let h = harness().await;
        h.store.apply_local_edit(edit("1", "x")).unwrap();
        h.remote.inject_on_set(ErrorKind::UserNeedAuthentication);

        assert_eq!(h.engine.push_edit("1").await.unwrap(), EditPush::NeedsLogin);
        assert!(h.store.token().unwrap().is_none());
        assert!(h.store.get_item("1").unwrap().unwrap().is_dirty());
        assert_eq!(h.engine.push_edit("1").await.unwrap(), EditPush::NeedsLogin);
    }
}
