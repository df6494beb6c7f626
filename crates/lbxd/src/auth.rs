//! Accounts and sessions.
//!
//! A user moves `unregistered -> pending verification -> verified`. Login
//! checks the auth hash against the stored hash-of-hash, consumes the
//! verification code on the first successful login, and mints a signed
//! session token whose id maps to the email in the session cache.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lbx_core::config::ServerConfig;
use lbx_core::{is_valid_email, now_micros};
use lbx_crypto::{hash_auth_key, verify_auth_key, KdfParams, TokenError, TokenId, TokenSigner};
use lbx_storage::{KvCache, ServerStore, StorageError, User};
use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::Span;

use crate::error::{ServiceError, ServiceResult};
use crate::queue::{EmailTask, TaskQueue};

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub token_lifetime: Duration,
    pub email_code_length: usize,
    pub email_code_lifetime: Duration,
    /// Deadline of one verification mail job
    pub mail_job_timeout: Duration,
    /// Argon2id cost of the stored auth key
    pub auth_key_params: KdfParams,
}

impl AuthSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            token_lifetime: Duration::from_secs(config.auth.token_lifetime_secs),
            email_code_length: config.auth.email_code_length,
            email_code_lifetime: Duration::from_secs(config.auth.email_code_lifetime_secs),
            mail_job_timeout: Duration::from_secs(config.mail.send_timeout_secs),
            auth_key_params: KdfParams::default(),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub email: String,
    pub token_id: TokenId,
}

pub struct AuthService {
    store: Arc<dyn ServerStore>,
    sessions: Arc<dyn KvCache>,
    email_codes: Arc<dyn KvCache>,
    tasks: Arc<dyn TaskQueue>,
    signer: TokenSigner,
    settings: AuthSettings,
    span: Span,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn ServerStore>,
        sessions: Arc<dyn KvCache>,
        email_codes: Arc<dyn KvCache>,
        tasks: Arc<dyn TaskQueue>,
        signer: TokenSigner,
        settings: AuthSettings,
        span: Span,
    ) -> Self {
        Self {
            store,
            sessions,
            email_codes,
            tasks,
            signer,
            settings,
            span,
        }
    }

    /// Create an unverified account and queue its verification mail.
    pub fn register(&self, email: &str, auth_hash: &[u8]) -> ServiceResult<()> {
        validate_credentials(email, auth_hash)?;

        let auth_key = hash_auth_key(auth_hash, &self.settings.auth_key_params)
            .map_err(|e| ServiceError::internal("hash auth key", e))?;
        let user = User {
            email: email.to_string(),
            is_email_verified: false,
            auth_key,
            created_at: now_micros(),
        };
        self.store.add_user(&user).map_err(|e| match e {
            StorageError::AlreadyExists => ServiceError::UserExists,
            e => ServiceError::storage("add user")(e),
        })?;

        self.issue_code(email)?;
        tracing::info!(parent: &self.span, email, "user registered");
        Ok(())
    }

    /// Check credentials and open a session. Returns the encoded token.
    ///
    /// `email_code` only matters while the account is unverified.
    pub fn login(&self, email: &str, auth_hash: &[u8], email_code: Option<&str>) -> ServiceResult<String> {
        validate_credentials(email, auth_hash)?;

        let user = self
            .store
            .get_user(email)
            .map_err(ServiceError::storage("get user"))?
            .ok_or(ServiceError::UserNotFound)?;

        let matches = verify_auth_key(auth_hash, &user.auth_key)
            .map_err(|e| ServiceError::internal("verify auth key", e))?;
        if !matches {
            tracing::info!(parent: &self.span, email, "login rejected: wrong credentials");
            return Err(ServiceError::WrongCredentials);
        }

        if !user.is_email_verified {
            self.verify_email_code(email, email_code)?;
        }

        let token = self.open_session(email)?;
        tracing::info!(parent: &self.span, email, "user logged in");
        Ok(token)
    }

    /// Resolve a session token to its owner.
    pub fn authenticate(&self, token: &str) -> ServiceResult<Session> {
        let token = self.signer.verify(token).map_err(|e| match e {
            TokenError::Expired => ServiceError::NeedAuthentication,
            _ => ServiceError::InvalidToken,
        })?;

        let email = self
            .sessions
            .get(&token.id.to_string())
            .map_err(ServiceError::storage("get session"))?
            .ok_or(ServiceError::NeedAuthentication)?;

        Ok(Session {
            email,
            token_id: token.id,
        })
    }

    /// Revoke a session before its token expires.
    pub fn logout(&self, session: &Session) -> ServiceResult<()> {
        self.sessions
            .delete(&session.token_id.to_string())
            .map_err(ServiceError::storage("delete session"))?;
        tracing::info!(parent: &self.span, email = %session.email, "user logged out");
        Ok(())
    }

    fn verify_email_code(&self, email: &str, code: Option<&str>) -> ServiceResult<()> {
        let cached = self
            .email_codes
            .get(email)
            .map_err(ServiceError::storage("get email code"))?;

        match (code, cached) {
            (Some(code), Some(cached)) if bool::from(code.as_bytes().ct_eq(cached.as_bytes())) => {
                self.store
                    .mark_email_verified(email)
                    .map_err(ServiceError::storage("mark email verified"))?;
                if let Err(e) = self.email_codes.delete(email) {
                    tracing::warn!(parent: &self.span, email, error = %e, "failed to drop used email code");
                }
                tracing::info!(parent: &self.span, email, "email verified");
                Ok(())
            }
            (None, None) => {
                // The earlier code expired: send a fresh one.
                self.issue_code(email)?;
                tracing::info!(parent: &self.span, email, "verification code reissued");
                Err(ServiceError::EmailNotVerified)
            }
            _ => Err(ServiceError::EmailNotVerified),
        }
    }

    fn issue_code(&self, email: &str) -> ServiceResult<()> {
        let code = generate_code(self.settings.email_code_length);
        self.email_codes
            .set(email, &code, self.settings.email_code_lifetime)
            .map_err(ServiceError::storage("cache email code"))?;
        self.tasks
            .enqueue(
                EmailTask::VerifyEmail {
                    email: email.to_string(),
                },
                self.settings.mail_job_timeout,
            )
            .map_err(|e| ServiceError::internal("enqueue verification mail", e))
    }

    fn open_session(&self, email: &str) -> ServiceResult<String> {
        let lifetime = self.settings.token_lifetime;
        let (encoded, token) = self
            .signer
            .mint(SystemTime::now() + lifetime)
            .map_err(|e| ServiceError::internal("mint token", e))?;
        self.sessions
            .set(&token.id.to_string(), email, lifetime)
            .map_err(ServiceError::storage("store session"))?;
        Ok(encoded)
    }
}

fn validate_credentials(email: &str, auth_hash: &[u8]) -> ServiceResult<()> {
    if !is_valid_email(email) {
        return Err(ServiceError::InvalidEmail);
    }
    if auth_hash.is_empty() {
        return Err(ServiceError::InvalidHash);
    }
    Ok(())
}

/// Random decimal code of `len` digits.
pub fn generate_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
