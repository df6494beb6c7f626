//! Vault client: account flows and item access on top of the sync engine.
//!
//! Passwords never leave this module. They are turned into an auth hash for
//! the server and an encryption key for the local vault, and wiped.
//! Item values are encrypted before they reach local storage, so the store,
//! the sync engine and the server only ever see ciphertext.

use std::sync::{Arc, Mutex, MutexGuard};

use lbx_core::{is_valid_email, CoreError, ErrorKind, ItemType, SecretValue, VaultItem};
use lbx_crypto::{decrypt, derive_keys, encrypt, DerivedKeys, EncryptionKey, KdfError, KdfParams};
use lbx_storage::{LocalEdit, StorageError, StoredCredentials};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, info, Span};
use zeroize::Zeroizing;

use crate::engine::{EditPush, LocalStore, SyncEngine, SyncError, SyncReport};
use crate::remote::{RemoteError, VaultRemote};

/// Minimum password length in characters (not bytes).
pub const MIN_PASSWORD_CHARS: usize = 8;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid email address")]
    InvalidEmail,

    #[error("password must be at least {MIN_PASSWORD_CHARS} characters")]
    PasswordTooShort,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("server unavailable and no matching offline credentials")]
    Offline,

    #[error("no email verification pending; log in first")]
    NoPendingVerification,

    #[error("wrong email verification code")]
    InvalidVerificationCode,

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("key derivation failed: {0}")]
    Kdf(#[from] KdfError),

    #[error("{op}: {message}")]
    Crypto { op: &'static str, message: String },

    #[error(transparent)]
    Value(#[from] CoreError),

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

    #[error(transparent)]
    Sync(#[from] SyncError),
}

impl ClientError {
    fn storage(op: &'static str) -> impl FnOnce(StorageError) -> ClientError {
        move |source| ClientError::Storage { op, source }
    }

    fn remote(op: &'static str) -> impl FnOnce(RemoteError) -> ClientError {
        move |source| ClientError::Remote { op, source }
    }

    fn crypto(op: &'static str) -> impl FnOnce(anyhow::Error) -> ClientError {
        move |e| ClientError::Crypto {
            op,
            message: format!("{e:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::InvalidEmail => ErrorKind::InvalidEmailFormat,
            ClientError::PasswordTooShort
            | ClientError::NoPendingVerification
            | ClientError::ItemNotFound(_)
            | ClientError::Kdf(_)
            | ClientError::Value(_) => ErrorKind::InvalidArgument,
            ClientError::NotLoggedIn => ErrorKind::UserNeedAuthentication,
            ClientError::Offline => ErrorKind::Unavailable,
            ClientError::InvalidVerificationCode => ErrorKind::UserEmailNotVerified,
            ClientError::Crypto { .. } | ClientError::Storage { .. } => ErrorKind::Internal,
            ClientError::Remote { source, .. } => source.kind(),
            ClientError::Sync(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    Online,
    /// Server unreachable; the password matched the stored key.
    Offline,
}

/// Listing view of an item: no value, no decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSummary {
    pub id: String,
    pub name: String,
    pub item_type: ItemType,
    /// Last local edit (or pull) stamp, unix micros
    pub updated_at: i64,
    /// Carries an edit the server has not acknowledged
    pub dirty: bool,
}

impl From<&VaultItem> for ItemSummary {
    fn from(item: &VaultItem) -> Self {
        Self {
            id: item.id.clone(),
            name: item.name.clone(),
            item_type: item.item_type,
            updated_at: item.client_updated_at,
            dirty: item.is_dirty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenedItem {
    pub summary: ItemSummary,
    pub value: SecretValue,
}

/// Keys of a login the server refused only because the email is unverified.
struct PendingVerification {
    email: String,
    keys: DerivedKeys,
}

pub struct VaultClient<R> {
    engine: SyncEngine<R>,
    kdf: KdfParams,
    pending: Mutex<Option<PendingVerification>>,
    span: Span,
}

impl<R: VaultRemote> VaultClient<R> {
    pub fn new(remote: R, store: Arc<dyn LocalStore>, kdf: KdfParams, span: Span) -> Self {
        Self {
            engine: SyncEngine::new(remote, store, span.clone()),
            kdf,
            pending: Mutex::new(None),
            span,
        }
    }

    pub fn engine(&self) -> &SyncEngine<R> {
        &self.engine
    }

    fn store(&self) -> &dyn LocalStore {
        self.engine.store().as_ref()
    }

    // a panic while holding the slot leaves nothing half-written in it
    fn pending(&self) -> MutexGuard<'_, Option<PendingVerification>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Account ──────────────────────────────────────────────────────────

    /// Create the account. The server mails a verification code; finish with
    /// [`login`](Self::login) then [`verify_email`](Self::verify_email).
    pub async fn register(&self, email: &str, password: SecretString) -> ClientResult<()> {
        let keys = self.derive(email, password).await?;
        self.engine
            .remote()
            .register(email, &keys.auth_hash)
            .await
            .map_err(ClientError::remote("register"))?;
        info!(parent: &self.span, email, "account registered, verification mail requested");
        Ok(())
    }

    /// Log in online, or offline against the stored key when the server is
    /// unreachable.
    ///
    /// A successful online login for a different account than the current
    /// vault owner clears the local vault first. An unverified account keeps
    /// the derived keys in memory for [`verify_email`](Self::verify_email)
    /// and fails with `UserEmailNotVerified`. A wrong password or unknown
    /// account removes the stored credentials.
    pub async fn login(&self, email: &str, password: SecretString) -> ClientResult<LoginMode> {
        let keys = self.derive(email, password).await?;

        match self.engine.remote().login(email, &keys.auth_hash, None).await {
            Ok(token) => {
                self.establish(email, &keys, token)?;
                info!(parent: &self.span, email, "logged in");
                Ok(LoginMode::Online)
            }
            Err(e) if e.is_unavailable() => self.login_offline(email, &keys),
            Err(e) => {
                match e.kind() {
                    ErrorKind::UserEmailNotVerified => {
                        *self.pending() = Some(PendingVerification {
                            email: email.to_string(),
                            keys,
                        });
                        info!(parent: &self.span, email, "email verification required");
                    }
                    ErrorKind::UserInvalidHash | ErrorKind::UserNotExists => {
                        self.store()
                            .delete_credentials()
                            .map_err(ClientError::storage("delete credentials"))?;
                    }
                    _ => {}
                }
                Err(ClientError::remote("login")(e))
            }
        }
    }

    /// Complete the login that failed with `UserEmailNotVerified`.
    pub async fn verify_email(&self, code: &str) -> ClientResult<()> {
        let pending = self.pending().take().ok_or(ClientError::NoPendingVerification)?;

        match self
            .engine
            .remote()
            .login(&pending.email, &pending.keys.auth_hash, Some(code.trim()))
            .await
        {
            Ok(token) => {
                self.establish(&pending.email, &pending.keys, token)?;
                info!(parent: &self.span, email = %pending.email, "email verified, logged in");
                Ok(())
            }
            Err(e) => {
                let kind = e.kind();
                if kind == ErrorKind::UserEmailNotVerified || e.is_unavailable() {
                    // let the user try another code
                    *self.pending() = Some(pending);
                }
                if kind == ErrorKind::UserEmailNotVerified {
                    return Err(ClientError::InvalidVerificationCode);
                }
                Err(ClientError::remote("verify email")(e))
            }
        }
    }

    /// Revoke the session on the server (best effort) and forget the
    /// credentials. The vault stays for the next login by the same owner.
    pub async fn logout(&self) -> ClientResult<()> {
        let token = self
            .store()
            .token()
            .map_err(ClientError::storage("read session token"))?;
        if let Some(token) = token {
            if let Err(e) = self.engine.remote().logout(&token).await {
                debug!(parent: &self.span, error = %e, "server logout failed, dropping token locally");
            }
        }
        self.store()
            .delete_credentials()
            .map_err(ClientError::storage("delete credentials"))?;
        *self.pending() = None;
        info!(parent: &self.span, "logged out");
        Ok(())
    }

    /// Whether a session token is stored, i.e. sync can reach the account.
    pub fn is_online(&self) -> ClientResult<bool> {
        Ok(self
            .store()
            .token()
            .map_err(ClientError::storage("read session token"))?
            .is_some())
    }

    /// Email of the logged-in account.
    pub fn current_user(&self) -> ClientResult<Option<String>> {
        Ok(self
            .store()
            .load_credentials()
            .map_err(ClientError::storage("load credentials"))?
            .map(|creds| creds.email))
    }

    async fn derive(&self, email: &str, password: SecretString) -> ClientResult<DerivedKeys> {
        let chars = password.expose_secret().chars().count();
        let mut bytes = Zeroizing::new(password.expose_secret().as_bytes().to_vec());
        drop(password);

        if !is_valid_email(email) {
            return Err(ClientError::InvalidEmail);
        }
        if chars < MIN_PASSWORD_CHARS {
            return Err(ClientError::PasswordTooShort);
        }

        let email = email.to_string();
        let params = self.kdf.clone();
        let keys = tokio::task::spawn_blocking(move || {
            derive_keys(&email, bytes.as_mut_slice(), &params)
        })
        .await
        .map_err(|e| ClientError::Crypto {
            op: "derive keys",
            message: e.to_string(),
        })??;
        Ok(keys)
    }

    fn establish(&self, email: &str, keys: &DerivedKeys, token: String) -> ClientResult<()> {
        let store = self.store();
        if store
            .switch_owner(email)
            .map_err(ClientError::storage("switch vault owner"))?
        {
            info!(parent: &self.span, email, "vault owner changed, local vault cleared");
        }
        store
            .save_credentials(&StoredCredentials {
                email: email.to_string(),
                encryption_key: Zeroizing::new(keys.encryption_key.as_bytes().to_vec()),
                token: Some(token),
            })
            .map_err(ClientError::storage("save credentials"))?;
        *self.pending() = None;
        Ok(())
    }

    fn login_offline(&self, email: &str, keys: &DerivedKeys) -> ClientResult<LoginMode> {
        let store = self.store();
        let owner = store.owner().map_err(ClientError::storage("read vault owner"))?;
        let creds = store
            .load_credentials()
            .map_err(ClientError::storage("load credentials"))?;

        let matches = match (&owner, &creds) {
            (Some(owner), Some(creds)) if owner == email && creds.email == email => bool::from(
                creds
                    .encryption_key
                    .as_slice()
                    .ct_eq(keys.encryption_key.as_bytes()),
            ),
            _ => false,
        };
        if !matches {
            return Err(ClientError::Offline);
        }
        info!(parent: &self.span, email, "server unavailable, logged in offline");
        Ok(LoginMode::Offline)
    }

    // ── Items ────────────────────────────────────────────────────────────

    fn encryption_key(&self) -> ClientResult<EncryptionKey> {
        let creds = self
            .store()
            .load_credentials()
            .map_err(ClientError::storage("load credentials"))?
            .ok_or(ClientError::NotLoggedIn)?;
        EncryptionKey::try_from(creds.encryption_key.as_slice())
            .map_err(ClientError::crypto("load encryption key"))
    }

    fn require_login(&self) -> ClientResult<()> {
        self.store()
            .load_credentials()
            .map_err(ClientError::storage("load credentials"))?
            .map(|_| ())
            .ok_or(ClientError::NotLoggedIn)
    }

    fn live_item(&self, id: &str) -> ClientResult<VaultItem> {
        self.store()
            .get_item(id)
            .map_err(ClientError::storage("read item"))?
            .filter(|item| !item.is_deleted)
            .ok_or_else(|| ClientError::ItemNotFound(id.to_string()))
    }

    /// Encrypt and store a new item (`id = None`) or replace an existing one,
    /// then push it at once when a session is active.
    ///
    /// An unreachable server, a rejected session or a newer server version
    /// leave the edit dirty for the next sync. Any other server rejection is
    /// returned; the local write stands either way.
    pub async fn put_item(
        &self,
        id: Option<&str>,
        name: &str,
        value: &SecretValue,
    ) -> ClientResult<ItemSummary> {
        let key = self.encryption_key()?;
        let plaintext = Zeroizing::new(value.encode()?);
        let ciphertext = encrypt(&key, &plaintext).map_err(ClientError::crypto("encrypt item"))?;

        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let item = self
            .store()
            .apply_local_edit(LocalEdit {
                id,
                name: name.to_string(),
                item_type: value.item_type(),
                value: ciphertext,
                is_deleted: false,
            })
            .map_err(ClientError::storage("store item"))?;
        debug!(parent: &self.span, id = %item.id, item_type = %item.item_type, "item saved");
        self.push_now(item).await
    }

    pub fn get_item(&self, id: &str) -> ClientResult<OpenedItem> {
        let key = self.encryption_key()?;
        let item = self.live_item(id)?;
        self.open(&key, &item)
    }

    /// Replace the item with a tombstone and push it like
    /// [`put_item`](Self::put_item) does.
    pub async fn delete_item(&self, id: &str) -> ClientResult<ItemSummary> {
        self.require_login()?;
        let item = self.live_item(id)?;
        let tombstone = self
            .store()
            .apply_local_edit(LocalEdit::tombstone(&item))
            .map_err(ClientError::storage("delete item"))?;
        debug!(parent: &self.span, id, "item deleted");
        self.push_now(tombstone).await
    }

    async fn push_now(&self, item: VaultItem) -> ClientResult<ItemSummary> {
        let id = match self.engine.push_edit(&item.id).await? {
            EditPush::Pushed { id } => id,
            outcome => {
                debug!(parent: &self.span, id = %item.id, ?outcome, "edit kept for next sync");
                return Ok(ItemSummary::from(&item));
            }
        };
        let pushed = self
            .store()
            .get_item(&id)
            .map_err(ClientError::storage("read item"))?;
        Ok(pushed.as_ref().map_or_else(|| ItemSummary::from(&item), ItemSummary::from))
    }

    /// Live items ordered by id.
    pub fn list_items(&self) -> ClientResult<Vec<ItemSummary>> {
        self.require_login()?;
        Ok(self
            .store()
            .list_items()
            .map_err(ClientError::storage("list items"))?
            .iter()
            .filter(|item| !item.is_deleted)
            .map(ItemSummary::from)
            .collect())
    }

    /// Local edits displaced by newer server versions.
    pub fn list_conflicts(&self) -> ClientResult<Vec<ItemSummary>> {
        self.require_login()?;
        Ok(self
            .store()
            .list_conflicts()
            .map_err(ClientError::storage("list conflicts"))?
            .iter()
            .map(ItemSummary::from)
            .collect())
    }

    /// Decrypt a shelved edit, identified by id and its `updated_at` stamp.
    pub fn open_conflict(&self, id: &str, updated_at: i64) -> ClientResult<OpenedItem> {
        let key = self.encryption_key()?;
        let item = self
            .store()
            .list_conflicts()
            .map_err(ClientError::storage("list conflicts"))?
            .into_iter()
            .find(|item| item.id == id && item.client_updated_at == updated_at && !item.is_deleted)
            .ok_or_else(|| ClientError::ItemNotFound(id.to_string()))?;
        self.open(&key, &item)
    }

    fn open(&self, key: &EncryptionKey, item: &VaultItem) -> ClientResult<OpenedItem> {
        let plaintext = Zeroizing::new(
            decrypt(key, &item.value).map_err(ClientError::crypto("decrypt item"))?,
        );
        Ok(OpenedItem {
            summary: ItemSummary::from(item),
            value: SecretValue::decode(item.item_type, &plaintext)?,
        })
    }

    pub async fn sync(&self) -> ClientResult<SyncReport> {
        Ok(self.engine.sync_cycle().await?)
    }
}
