//! Server-side auth key: an Argon2id PHC string of the client's auth hash.
//!
//! The server only ever stores this second hash. A leaked user table gives
//! neither the auth hash needed to log in nor anything about the encryption
//! key.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::RngCore;

use crate::kdf::KdfParams;

/// Hash an auth hash for storage using the given cost parameters.
pub fn hash_auth_key(auth_hash: &[u8], params: &KdfParams) -> anyhow::Result<String> {
    let argon2_params = Params::new(params.mem_cost_kib, params.time_cost, params.parallelism, None)
        .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| anyhow::anyhow!("auth key salt encoding failed: {e}"))?;
    let hash = argon2
        .hash_password(auth_hash, &salt)
        .map_err(|e| anyhow::anyhow!("auth key hashing failed: {e}"))?;
    Ok(hash.to_string())
}

/// Check an auth hash against a stored auth key.
///
/// `Ok(false)` is a mismatch; `Err` means the stored key is unreadable.
pub fn verify_auth_key(auth_hash: &[u8], stored: &str) -> anyhow::Result<bool> {
    let parsed =
        PasswordHash::new(stored).map_err(|e| anyhow::anyhow!("stored auth key is malformed: {e}"))?;
    match Argon2::default().verify_password(auth_hash, &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(anyhow::anyhow!("auth key verification failed: {e}")),
    }
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
    fn test_verify_matching_hash() {
        let stored = hash_auth_key(&[1u8; 32], &fast()).unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(verify_auth_key(&[1u8; 32], &stored).unwrap());
    }

    #[test]
    fn test_verify_mismatch() {
        let stored = hash_auth_key(&[1u8; 32], &fast()).unwrap();
        assert!(!verify_auth_key(&[2u8; 32], &stored).unwrap());
    }

    #[test]
    fn test_salted_per_call() {
        let a = hash_auth_key(&[1u8; 32], &fast()).unwrap();
        let b = hash_auth_key(&[1u8; 32], &fast()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_stored_key() {
        assert!(verify_auth_key(&[1u8; 32], "not-a-phc-string").is_err());
    }
}
