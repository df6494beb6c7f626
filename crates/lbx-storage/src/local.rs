//! Client-side store: the local vault replica, its conflict shelf, and the
//! signed-in owner's credentials.
//!
//! One SQLite connection behind a mutex gives a single-writer discipline:
//! interactive edits and the sync loop never interleave inside an item's
//! read-modify-write, and every method that touches more than one row runs in
//! a transaction.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lbx_core::{next_client_stamp, ItemType, VaultItem};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{StorageError, StorageResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS vault_items (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        item_type INTEGER NOT NULL,
        value BLOB NOT NULL,
        server_updated_at INTEGER NOT NULL,
        client_updated_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS conflict_items (
        id TEXT NOT NULL,
        name TEXT NOT NULL,
        item_type INTEGER NOT NULL,
        value BLOB NOT NULL,
        server_updated_at INTEGER NOT NULL,
        client_updated_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (id, client_updated_at)
    );

    CREATE TABLE IF NOT EXISTS app (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_vault_items_server_updated
        ON vault_items(server_updated_at);";

const ITEM_COLUMNS: &str =
    "id, name, item_type, value, server_updated_at, client_updated_at, is_deleted";

const KEY_OWNER: &str = "owner";
const KEY_EMAIL: &str = "creds_email";
const KEY_TOKEN: &str = "creds_token";
const KEY_ENCRYPTION_KEY: &str = "creds_encryption_key";
const KEY_WATERMARK: &str = "pull_watermark";

/// What [`VaultStore::apply_remote`] did with a pulled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// The local row was already at or past the incoming version; only the
    /// watermark moved.
    Unchanged,
    Replaced,
    /// The local row went to the conflict shelf before being replaced.
    Shelved,
}

/// A local change to one item, stamped by the store when applied.
#[derive(Debug, Clone)]
pub struct LocalEdit {
    pub id: String,
    pub name: String,
    pub item_type: ItemType,
    pub value: Vec<u8>,
    pub is_deleted: bool,
}

impl LocalEdit {
    /// Deletion of `item`: same id and type, no name, no value.
    pub fn tombstone(item: &VaultItem) -> Self {
        Self {
            id: item.id.clone(),
            name: String::new(),
            item_type: item.item_type,
            value: Vec::new(),
            is_deleted: true,
        }
    }
}

pub trait VaultStore: Send + Sync {
    fn get_item(&self, id: &str) -> StorageResult<Option<VaultItem>>;

    /// All rows, tombstones included, ordered by id.
    fn list_items(&self) -> StorageResult<Vec<VaultItem>>;

    /// Items carrying an unacknowledged local edit, oldest server version first.
    fn list_dirty(&self) -> StorageResult<Vec<VaultItem>>;

    /// Highest server version incorporated by a pull; 0 when never synced.
    ///
    /// Pushes do not move it: versions other devices wrote between a pull
    /// and a push must still be listed by the next pull.
    fn pull_watermark(&self) -> StorageResult<i64>;

    /// Apply a local edit atomically, stamping a fresh `client_updated_at`
    /// and keeping the item's known server version.
    fn apply_local_edit(&self, edit: LocalEdit) -> StorageResult<VaultItem>;

    /// Write a pulled item and raise the pull watermark to its version.
    ///
    /// Inside the same transaction the current local row (if any) is passed
    /// to `shelve_local`; when that returns true the local row is copied to
    /// the conflict shelf first. A local row already at or past the incoming
    /// version (the echo of our own push, possibly edited since) is left alone.
    fn apply_remote(
        &self,
        incoming: &VaultItem,
        shelve_local: &dyn Fn(&VaultItem) -> bool,
    ) -> StorageResult<RemoteApply>;

    /// Record a successful push of the edit stamped `pushed_client_updated_at`.
    ///
    /// The item becomes clean at `version` unless it was edited again in the
    /// meantime, in which case only its server version advances. A different
    /// `canonical_id` re-keys the row.
    fn mark_pushed(
        &self,
        id: &str,
        canonical_id: &str,
        pushed_client_updated_at: i64,
        version: i64,
    ) -> StorageResult<()>;

    fn list_conflicts(&self) -> StorageResult<Vec<VaultItem>>;
}

/// Credentials as persisted in the app table.
#[derive(Clone)]
pub struct StoredCredentials {
    pub email: String,
    pub encryption_key: Zeroizing<Vec<u8>>,
    pub token: Option<String>,
}

impl std::fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("email", &self.email)
            .field("encryption_key", &"[REDACTED]")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    /// Email of the account whose items the local vault holds.
    fn owner(&self) -> StorageResult<Option<String>>;

    /// Make `email` the owner. If another account owned the vault, the vault
    /// and conflict tables are emptied in the same transaction. Returns
    /// whether anything was cleared.
    fn switch_owner(&self, email: &str) -> StorageResult<bool>;

    fn load_credentials(&self) -> StorageResult<Option<StoredCredentials>>;

    fn save_credentials(&self, creds: &StoredCredentials) -> StorageResult<()>;

    /// Remove email, key and token. The owner and the vault stay.
    fn delete_credentials(&self) -> StorageResult<()>;

    fn token(&self) -> StorageResult<Option<String>>;

    fn set_token(&self, token: &str) -> StorageResult<()>;

    fn clear_token(&self) -> StorageResult<()>;
}

/// SQLite-backed [`VaultStore`] + [`CredentialStore`].
#[derive(Clone)]
pub struct SqliteLocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLocalStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> StorageResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

type RawItem = (String, String, i32, Vec<u8>, i64, i64, bool);

fn raw_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_item(raw: RawItem) -> StorageResult<VaultItem> {
    let (id, name, item_type, value, server_updated_at, client_updated_at, is_deleted) = raw;
    let item_type = ItemType::try_from(item_type)
        .map_err(|e| StorageError::Corrupt(format!("vault item {id}: {e}")))?;
    Ok(VaultItem {
        id,
        name,
        item_type,
        value,
        server_updated_at,
        client_updated_at,
        is_deleted,
    })
}

fn query_items(conn: &Connection, sql: &str) -> StorageResult<Vec<VaultItem>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map([], raw_item)?;
    let mut items = Vec::new();
    for row in rows {
        items.push(into_item(row?)?);
    }
    Ok(items)
}

fn get_item_tx(conn: &Connection, id: &str) -> StorageResult<Option<VaultItem>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM vault_items WHERE id = ?1"),
            params![id],
            raw_item,
        )
        .optional()?;
    raw.map(into_item).transpose()
}

fn upsert_item(conn: &Connection, table: &str, item: &VaultItem) -> StorageResult<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO {table} ({ITEM_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
        params![
            item.id,
            item.name,
            item.item_type.as_i32(),
            item.value,
            item.server_updated_at,
            item.client_updated_at,
            item.is_deleted,
        ],
    )?;
    Ok(())
}

fn get_app(conn: &Connection, key: &str) -> StorageResult<Option<Vec<u8>>> {
    Ok(conn
        .query_row("SELECT value FROM app WHERE key = ?1", params![key], |row| {
            row.get::<_, Vec<u8>>(0)
        })
        .optional()?)
}

fn get_app_string(conn: &Connection, key: &str) -> StorageResult<Option<String>> {
    get_app(conn, key)?
        .map(|bytes| {
            String::from_utf8(bytes).map_err(|_| StorageError::Corrupt(format!("app key {key} is not utf-8")))
        })
        .transpose()
}

fn set_app(conn: &Connection, key: &str, value: &[u8]) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO app (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}

fn delete_app(conn: &Connection, key: &str) -> StorageResult<()> {
    conn.execute("DELETE FROM app WHERE key = ?1", params![key])?;
    Ok(())
}

fn get_watermark(conn: &Connection) -> StorageResult<i64> {
    match get_app_string(conn, KEY_WATERMARK)? {
        Some(v) => v
            .parse()
            .map_err(|_| StorageError::Corrupt(format!("pull watermark {v:?}"))),
        None => Ok(0),
    }
}

fn commit(tx: Transaction<'_>) -> StorageResult<()> {
    tx.commit()?;
    Ok(())
}

impl VaultStore for SqliteLocalStore {
    fn get_item(&self, id: &str) -> StorageResult<Option<VaultItem>> {
        let conn = self.conn()?;
        get_item_tx(&conn, id)
    }

    fn list_items(&self) -> StorageResult<Vec<VaultItem>> {
        let conn = self.conn()?;
        query_items(
            &conn,
            &format!("SELECT {ITEM_COLUMNS} FROM vault_items ORDER BY id"),
        )
    }

    fn list_dirty(&self) -> StorageResult<Vec<VaultItem>> {
        let conn = self.conn()?;
        query_items(
            &conn,
            &format!(
                "SELECT {ITEM_COLUMNS} FROM vault_items
                 WHERE client_updated_at != server_updated_at
                 ORDER BY server_updated_at ASC, client_updated_at ASC"
            ),
        )
    }

    fn pull_watermark(&self) -> StorageResult<i64> {
        let conn = self.conn()?;
        get_watermark(&conn)
    }

    fn apply_local_edit(&self, edit: LocalEdit) -> StorageResult<VaultItem> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let (server_updated_at, previous) = match get_item_tx(&tx, &edit.id)? {
            Some(existing) => (existing.server_updated_at, existing.client_updated_at),
            None => (0, 0),
        };
        let item = VaultItem {
            id: edit.id,
            name: edit.name,
            item_type: edit.item_type,
            value: edit.value,
            server_updated_at,
            client_updated_at: next_client_stamp(previous, server_updated_at),
            is_deleted: edit.is_deleted,
        };
        upsert_item(&tx, "vault_items", &item)?;
        commit(tx)?;
        Ok(item)
    }

    fn apply_remote(
        &self,
        incoming: &VaultItem,
        shelve_local: &dyn Fn(&VaultItem) -> bool,
    ) -> StorageResult<RemoteApply> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let outcome = match get_item_tx(&tx, &incoming.id)? {
            Some(local) if local.server_updated_at >= incoming.server_updated_at => {
                RemoteApply::Unchanged
            }
            Some(local) if shelve_local(&local) => {
                upsert_item(&tx, "conflict_items", &local)?;
                RemoteApply::Shelved
            }
            _ => RemoteApply::Replaced,
        };
        if outcome != RemoteApply::Unchanged {
            upsert_item(&tx, "vault_items", incoming)?;
        }
        if incoming.server_updated_at > get_watermark(&tx)? {
            set_app(&tx, KEY_WATERMARK, incoming.server_updated_at.to_string().as_bytes())?;
        }
        commit(tx)?;
        Ok(outcome)
    }

    fn mark_pushed(
        &self,
        id: &str,
        canonical_id: &str,
        pushed_client_updated_at: i64,
        version: i64,
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(mut item) = get_item_tx(&tx, id)? else {
            debug!(id, "pushed item vanished locally");
            return Ok(());
        };

        item.server_updated_at = version;
        if item.client_updated_at == pushed_client_updated_at {
            item.client_updated_at = version;
        }
        if !canonical_id.is_empty() && canonical_id != id {
            tx.execute("DELETE FROM vault_items WHERE id = ?1", params![id])?;
            item.id = canonical_id.to_string();
        }
        upsert_item(&tx, "vault_items", &item)?;
        commit(tx)
    }

    fn list_conflicts(&self) -> StorageResult<Vec<VaultItem>> {
        let conn = self.conn()?;
        query_items(
            &conn,
            &format!("SELECT {ITEM_COLUMNS} FROM conflict_items ORDER BY id, client_updated_at"),
        )
    }
}

impl CredentialStore for SqliteLocalStore {
    fn owner(&self) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        get_app_string(&conn, KEY_OWNER)
    }

    fn switch_owner(&self, email: &str) -> StorageResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let current = get_app_string(&tx, KEY_OWNER)?;
        if current.as_deref() == Some(email) {
            return Ok(false);
        }
        tx.execute_batch("DELETE FROM vault_items; DELETE FROM conflict_items;")?;
        delete_app(&tx, KEY_WATERMARK)?;
        set_app(&tx, KEY_OWNER, email.as_bytes())?;
        commit(tx)?;
        Ok(current.is_some())
    }

    fn load_credentials(&self) -> StorageResult<Option<StoredCredentials>> {
        let conn = self.conn()?;
        let Some(email) = get_app_string(&conn, KEY_EMAIL)? else {
            return Ok(None);
        };
        let Some(key) = get_app(&conn, KEY_ENCRYPTION_KEY)? else {
            return Ok(None);
        };
        Ok(Some(StoredCredentials {
            email,
            encryption_key: Zeroizing::new(key),
            token: get_app_string(&conn, KEY_TOKEN)?,
        }))
    }

    fn save_credentials(&self, creds: &StoredCredentials) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        set_app(&tx, KEY_EMAIL, creds.email.as_bytes())?;
        set_app(&tx, KEY_ENCRYPTION_KEY, &creds.encryption_key)?;
        match &creds.token {
            Some(token) => set_app(&tx, KEY_TOKEN, token.as_bytes())?,
            None => delete_app(&tx, KEY_TOKEN)?,
        }
        commit(tx)
    }

    fn delete_credentials(&self) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for key in [KEY_EMAIL, KEY_ENCRYPTION_KEY, KEY_TOKEN] {
            delete_app(&tx, key)?;
        }
        commit(tx)
    }

    fn token(&self) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        get_app_string(&conn, KEY_TOKEN)
    }

    fn set_token(&self, token: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        set_app(&conn, KEY_TOKEN, token.as_bytes())
    }

    fn clear_token(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        delete_app(&conn, KEY_TOKEN)
    }
}
