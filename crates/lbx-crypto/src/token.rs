//! Session tokens
//!
//! Token format (binary, then hex-encoded):
//! ```text
//! [1 byte: version = 1]
//! [12 bytes: random token id]
//! [15 bytes: expiry]  = [1: encoding = 1][8: unix secs i64 BE][4: nanos u32 BE][2: utc offset min i16 BE]
//! [32 bytes: HMAC-SHA256(key, first 28 bytes)]
//! ```
//!
//! The server keeps only `id → email` in its session cache; everything else
//! rides in the token and is covered by the MAC.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: u8 = 1;
pub const TOKEN_ID_SIZE: usize = 12;
pub const EXPIRY_SIZE: usize = 15;
pub const MAC_SIZE: usize = 32;
/// Raw token length before hex encoding
pub const TOKEN_SIZE: usize = 1 + TOKEN_ID_SIZE + EXPIRY_SIZE + MAC_SIZE;
/// Shortest accepted HMAC secret
pub const MIN_SECRET_LEN: usize = 16;

const SIGNED_LEN: usize = TOKEN_SIZE - MAC_SIZE;
const EXPIRY_ENCODING: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    SecretTooShort(usize),
    #[error("malformed token: {0}")]
    Malformed(&'static str),
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

impl TokenError {
    /// Structural problems, as opposed to a well-formed token that has expired.
    pub fn is_format_error(&self) -> bool {
        matches!(self, TokenError::Malformed(_) | TokenError::BadSignature)
    }
}

/// Random identifier of one session; the session cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId([u8; TOKEN_ID_SIZE]);

impl TokenId {
    pub fn as_bytes(&self) -> &[u8; TOKEN_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({self})")
    }
}

/// A token whose signature has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub id: TokenId,
    pub expires_at: SystemTime,
}

impl Token {
    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expires_at.duration_since(now).unwrap_or(Duration::ZERO)
    }
}

/// Mints and verifies tokens under one HMAC key.
pub struct TokenSigner {
    key: Zeroizing<Vec<u8>>,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(TokenError::SecretTooShort(secret.len()));
        }
        Ok(Self {
            key: Zeroizing::new(secret.to_vec()),
        })
    }

    /// Mint a fresh token expiring at `expires_at`. Returns the encoded string.
    pub fn mint(&self, expires_at: SystemTime) -> Result<(String, Token), TokenError> {
        let mut id = [0u8; TOKEN_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut id);

        let mut raw = [0u8; TOKEN_SIZE];
        raw[0] = TOKEN_VERSION;
        raw[1..1 + TOKEN_ID_SIZE].copy_from_slice(&id);
        raw[1 + TOKEN_ID_SIZE..SIGNED_LEN].copy_from_slice(&encode_expiry(expires_at)?);

        let mac = self.mac(&raw[..SIGNED_LEN])?.finalize().into_bytes();
        raw[SIGNED_LEN..].copy_from_slice(&mac);

        let token = Token {
            id: TokenId(id),
            expires_at,
        };
        Ok((hex::encode(raw), token))
    }

    /// Check structure, signature and expiry against the current time.
    pub fn verify(&self, encoded: &str) -> Result<Token, TokenError> {
        self.verify_at(encoded, SystemTime::now())
    }

    pub fn verify_at(&self, encoded: &str, now: SystemTime) -> Result<Token, TokenError> {
        let token = self.decode(encoded)?;
        if token.expires_at <= now {
            return Err(TokenError::Expired);
        }
        Ok(token)
    }

    /// Check structure and signature only.
    pub fn decode(&self, encoded: &str) -> Result<Token, TokenError> {
        if encoded.len() != TOKEN_SIZE * 2 {
            return Err(TokenError::Malformed("length"));
        }
        let raw = hex::decode(encoded).map_err(|_| TokenError::Malformed("hex"))?;
        if raw[0] != TOKEN_VERSION {
            return Err(TokenError::Malformed("version"));
        }

        self.mac(&raw[..SIGNED_LEN])?
            .verify_slice(&raw[SIGNED_LEN..])
            .map_err(|_| TokenError::BadSignature)?;

        let mut id = [0u8; TOKEN_ID_SIZE];
        id.copy_from_slice(&raw[1..1 + TOKEN_ID_SIZE]);
        let expires_at = decode_expiry(&raw[1 + TOKEN_ID_SIZE..SIGNED_LEN])?;

        Ok(Token {
            id: TokenId(id),
            expires_at,
        })
    }

    fn mac(&self, signed: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|_| TokenError::SecretTooShort(self.key.len()))?;
        mac.update(signed);
        Ok(mac)
    }
}

fn encode_expiry(at: SystemTime) -> Result<[u8; EXPIRY_SIZE], TokenError> {
    let since = at
        .duration_since(UNIX_EPOCH)
        .map_err(|_| TokenError::Malformed("expiry before unix epoch"))?;
    let secs = i64::try_from(since.as_secs()).map_err(|_| TokenError::Malformed("expiry overflow"))?;

    let mut out = [0u8; EXPIRY_SIZE];
    out[0] = EXPIRY_ENCODING;
    out[1..9].copy_from_slice(&secs.to_be_bytes());
    out[9..13].copy_from_slice(&since.subsec_nanos().to_be_bytes());
    // bytes 13..15: UTC offset in minutes, always zero
    Ok(out)
}

fn decode_expiry(bytes: &[u8]) -> Result<SystemTime, TokenError> {
    if bytes.len() != EXPIRY_SIZE || bytes[0] != EXPIRY_ENCODING {
        return Err(TokenError::Malformed("expiry encoding"));
    }
    let mut secs = [0u8; 8];
    secs.copy_from_slice(&bytes[1..9]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&bytes[9..13]);
    let mut offset = [0u8; 2];
    offset.copy_from_slice(&bytes[13..15]);

    let secs = i64::from_be_bytes(secs);
    let nanos = u32::from_be_bytes(nanos);
    let offset_min = i16::from_be_bytes(offset);
    if secs < 0 || nanos >= 1_000_000_000 {
        return Err(TokenError::Malformed("expiry range"));
    }

    let utc_secs = secs - i64::from(offset_min) * 60;
    let utc_secs = u64::try_from(utc_secs).map_err(|_| TokenError::Malformed("expiry range"))?;
    UNIX_EPOCH
        .checked_add(Duration::new(utc_secs, nanos))
        .ok_or(TokenError::Malformed("expiry range"))
}
