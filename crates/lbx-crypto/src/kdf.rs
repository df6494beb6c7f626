//! Key derivation: (email, password) → auth hash + encryption key
//!
//! Both outputs come from Argon2id over the same password and salt. The auth
//! hash spends one extra pass of time cost, so neither output can stand in
//! for the other.

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

use crate::KEY_SIZE;

#[derive(Debug, Error)]
pub enum KdfError {
    #[error("email must not be empty")]
    EmptyEmail,
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("Argon2id failed: {0}")]
    Argon2(String),
}

macro_rules! secret_bytes {
    ($name:ident) => {
        /// 256-bit derived secret, zeroized on drop.
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_bytes!(AuthHash);
secret_bytes!(EncryptionKey);

impl TryFrom<&[u8]> for EncryptionKey {
    type Error = anyhow::Error;

    fn try_from(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("encryption key must be {KEY_SIZE} bytes, got {}", bytes.len()))?;
        Ok(Self::from_bytes(bytes))
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Baseline time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

#[derive(Debug)]
pub struct DerivedKeys {
    pub auth_hash: AuthHash,
    pub encryption_key: EncryptionKey,
}

/// Derive the auth hash and the encryption key from a login.
///
/// The password buffer is overwritten with zeros before this returns,
/// whether derivation succeeded or not.
pub fn derive_keys(
    email: &str,
    password: &mut [u8],
    params: &KdfParams,
) -> Result<DerivedKeys, KdfError> {
    let result = derive(email, password, params);
    password.zeroize();
    result
}

fn derive(email: &str, password: &[u8], params: &KdfParams) -> Result<DerivedKeys, KdfError> {
    if email.is_empty() {
        return Err(KdfError::EmptyEmail);
    }
    if password.is_empty() {
        return Err(KdfError::EmptyPassword);
    }

    let salt = email_salt(email);
    let encryption_key = argon2id(password, &salt, params, params.time_cost)?;
    let auth_hash = argon2id(password, &salt, params, params.time_cost + 1)?;

    Ok(DerivedKeys {
        auth_hash: AuthHash::from_bytes(auth_hash),
        encryption_key: EncryptionKey::from_bytes(encryption_key),
    })
}

/// Argon2 needs at least 8 bytes of salt; short addresses are not enough.
fn email_salt(email: &str) -> [u8; 32] {
    Sha256::digest(email.as_bytes()).into()
}

fn argon2id(
    password: &[u8],
    salt: &[u8],
    params: &KdfParams,
    time_cost: u32,
) -> Result<[u8; KEY_SIZE], KdfError> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| KdfError::Argon2(format!("invalid params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut out = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| KdfError::Argon2(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let a = derive_keys("a@x.com", &mut b"hunter22".to_vec(), &fast()).unwrap();
        let b = derive_keys("a@x.com", &mut b"hunter22".to_vec(), &fast()).unwrap();

        assert_eq!(a.auth_hash.as_bytes(), b.auth_hash.as_bytes());
        assert_eq!(a.encryption_key.as_bytes(), b.encryption_key.as_bytes());
    }

    #[test]
    fn test_auth_hash_differs_from_encryption_key() {
        let keys = derive_keys("a@x.com", &mut b"hunter22".to_vec(), &fast()).unwrap();
        assert_ne!(keys.auth_hash.as_bytes(), keys.encryption_key.as_bytes());
    }

    #[test]
    fn test_email_is_salt() {
        let a = derive_keys("a@x.com", &mut b"hunter22".to_vec(), &fast()).unwrap();
        let b = derive_keys("b@x.com", &mut b"hunter22".to_vec(), &fast()).unwrap();
        assert_ne!(a.encryption_key.as_bytes(), b.encryption_key.as_bytes());
    }

    #[test]
    fn test_password_wiped() {
        let mut password = b"correct horse".to_vec();
        derive_keys("a@x.com", &mut password, &fast()).unwrap();
        assert!(password.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_password_wiped_on_rejection() {
        let mut password = b"correct horse".to_vec();
        let err = derive_keys("", &mut password, &fast()).unwrap_err();
        assert!(matches!(err, KdfError::EmptyEmail));
        assert!(password.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_password_rejected() {
        let err = derive_keys("a@x.com", &mut [], &fast()).unwrap_err();
        assert!(matches!(err, KdfError::EmptyPassword));
    }

    #[test]
    fn test_debug_redacted() {
        let key = EncryptionKey::from_bytes([7u8; KEY_SIZE]);
        assert_eq!(format!("{key:?}"), "EncryptionKey { bytes: \"[REDACTED]\" }");
    }

    #[test]
    fn test_key_from_slice_length() {
        assert!(EncryptionKey::try_from(&[0u8; 31][..]).is_err());
        assert!(EncryptionKey::try_from(&[0u8; 32][..]).is_ok());
    }
}
