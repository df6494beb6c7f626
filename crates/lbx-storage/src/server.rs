//! Server-side store: accounts and every user's encrypted vault items.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lbx_core::{ItemType, VaultItem};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{StorageError, StorageResult};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        email TEXT PRIMARY KEY,
        is_email_verified INTEGER NOT NULL DEFAULT 0,
        auth_key TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS vault_items (
        id TEXT NOT NULL,
        email TEXT NOT NULL,
        name TEXT NOT NULL,
        item_type INTEGER NOT NULL,
        value BLOB NOT NULL,
        updated_at INTEGER NOT NULL,
        is_deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (id, email)
    );

    CREATE INDEX IF NOT EXISTS idx_vault_items_email_updated
        ON vault_items(email, updated_at);";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub email: String,
    pub is_email_verified: bool,
    /// PHC string of the client's auth hash
    pub auth_key: String,
    /// Unix microseconds
    pub created_at: i64,
}

pub trait ServerStore: Send + Sync {
    /// Fails with [`StorageError::AlreadyExists`] if the email is taken.
    fn add_user(&self, user: &User) -> StorageResult<()>;

    fn get_user(&self, email: &str) -> StorageResult<Option<User>>;

    fn mark_email_verified(&self, email: &str) -> StorageResult<()>;

    /// Items of `email` strictly newer than `since`, oldest first.
    fn list_vault_items(&self, email: &str, since: Option<i64>) -> StorageResult<Vec<VaultItem>>;

    /// Atomically write `item` if the stored version equals `expected`.
    ///
    /// `item.server_updated_at` is the proposed new version; the store raises
    /// it above every version already held for `email` and returns the one it
    /// wrote, so versions never repeat or go back within an account. A row
    /// that does not exist yet is inserted. Fails with
    /// [`StorageError::VersionConflict`] when the stored version differs;
    /// nothing is written in that case.
    fn compare_and_set_item(&self, email: &str, item: &VaultItem, expected: i64) -> StorageResult<i64>;

    /// Cheap liveness probe.
    fn ping(&self) -> StorageResult<()>;
}

/// SQLite-backed [`ServerStore`].
#[derive(Clone)]
pub struct SqliteServerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteServerStore {
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

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        email: row.get(0)?,
        is_email_verified: row.get(1)?,
        auth_key: row.get(2)?,
        created_at: row.get(3)?,
    })
}

impl ServerStore for SqliteServerStore {
    fn add_user(&self, user: &User) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (email, is_email_verified, auth_key, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user.email, user.is_email_verified, user.auth_key, user.created_at],
        )
        .map_err(|e| {
            if StorageError::is_unique_violation(&e) {
                StorageError::AlreadyExists
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn get_user(&self, email: &str) -> StorageResult<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT email, is_email_verified, auth_key, created_at FROM users WHERE email = ?1",
                params![email],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn mark_email_verified(&self, email: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE users SET is_email_verified = 1 WHERE email = ?1",
            params![email],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    fn list_vault_items(&self, email: &str, since: Option<i64>) -> StorageResult<Vec<VaultItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, item_type, value, updated_at, is_deleted
             FROM vault_items
             WHERE email = ?1 AND updated_at > ?2
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map(params![email, since.unwrap_or(i64::MIN)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, name, item_type, value, updated_at, is_deleted) = row?;
            let item_type = ItemType::try_from(item_type)
                .map_err(|e| StorageError::Corrupt(format!("vault item {id}: {e}")))?;
            items.push(VaultItem {
                id,
                name,
                item_type,
                value,
                server_updated_at: updated_at,
                client_updated_at: updated_at,
                is_deleted,
            });
        }
        Ok(items)
    }

    fn compare_and_set_item(&self, email: &str, item: &VaultItem, expected: i64) -> StorageResult<i64> {
        let conn = self.conn()?;
        // Single statement: the version check, the version bump and the write
        // cannot interleave with another writer.
        let written = conn
            .query_row(
                "INSERT INTO vault_items (id, email, name, item_type, value, updated_at, is_deleted)
                 VALUES (?1, ?2, ?3, ?4, ?5,
                     MAX(?6, (SELECT COALESCE(MAX(updated_at), 0) + 1 FROM vault_items WHERE email = ?2)),
                     ?7)
                 ON CONFLICT (id, email) DO UPDATE SET
                     name = excluded.name,
                     item_type = excluded.item_type,
                     value = excluded.value,
                     updated_at = excluded.updated_at,
                     is_deleted = excluded.is_deleted
                 WHERE vault_items.updated_at = ?8
                 RETURNING updated_at",
                params![
                    item.id,
                    email,
                    item.name,
                    item.item_type.as_i32(),
                    item.value,
                    item.server_updated_at,
                    item.is_deleted,
                    expected,
                ],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        written.ok_or(StorageError::VersionConflict { expected })
    }

    fn ping(&self) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}
