//! lbx-crypto: client-side E2E encryption and server-side credential primitives
//!
//! Client:
//! ```text
//! (email, password)
//!   ├── Auth hash       Argon2id(t+1), sent to the server, never stored locally
//!   └── Encryption key  Argon2id(t),   stays on the device
//!         └── Item value: 32 KiB chunks, XChaCha20-Poly1305
//!               record = nonce(24) || ciphertext || tag(16), AAD = chunk counter (u32 LE)
//! ```
//!
//! Server:
//! - Auth key: Argon2id PHC string of the received auth hash (a hash of the hash)
//! - Session token: `version | id | expiry | HMAC-SHA256`, hex encoded

pub mod authkey;
pub mod kdf;
pub mod stream;
pub mod token;

pub use authkey::{hash_auth_key, verify_auth_key};
pub use kdf::{derive_keys, AuthHash, DerivedKeys, EncryptionKey, KdfError, KdfParams};
pub use stream::{decrypt, decrypted_len, encrypt, encrypted_len, DecryptReader, EncryptWriter};
pub use token::{Token, TokenError, TokenId, TokenSigner};

/// Size of derived keys and auth hashes in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Plaintext bytes per encrypted chunk
pub const CHUNK_SIZE: usize = 32 * 1024;
