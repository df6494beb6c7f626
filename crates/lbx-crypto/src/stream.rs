//! Chunked XChaCha20-Poly1305 for item values of any size
//!
//! Ciphertext format (binary):
//! ```text
//! record 0: [24 bytes: random nonce][≤32768 bytes: ciphertext][16 bytes: tag]
//! record 1: ...
//! AAD(record i) = i as u32, little-endian
//! ```
//!
//! Every record except the last carries a full 32 KiB chunk. Empty plaintext
//! produces no records at all. The counter in the AAD pins each record to its
//! position, so records cannot be reordered, dropped from the middle, or
//! spliced in from another value.
//!
//! There is no end-of-value marker. Cutting whole records off the end leaves
//! a valid shorter ciphertext that decrypts to a prefix of the plaintext.
//! Callers that need the full value must know its length some other way.

use std::io::{self, Read, Write};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::kdf::EncryptionKey;
use crate::{CHUNK_SIZE, NONCE_SIZE, TAG_SIZE};

const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
const RECORD_SIZE: usize = CHUNK_SIZE + OVERHEAD;

/// Exact ciphertext length for `plain_len` bytes of plaintext.
pub fn encrypted_len(plain_len: usize) -> usize {
    let full = plain_len / CHUNK_SIZE;
    let rem = plain_len % CHUNK_SIZE;
    full * RECORD_SIZE + if rem > 0 { rem + OVERHEAD } else { 0 }
}

/// Exact plaintext length for a ciphertext of `cipher_len` bytes.
///
/// Fails when no plaintext length could have produced that size.
pub fn decrypted_len(cipher_len: usize) -> anyhow::Result<usize> {
    let full = cipher_len / RECORD_SIZE;
    let rem = cipher_len % RECORD_SIZE;
    if rem == 0 {
        return Ok(full * CHUNK_SIZE);
    }
    if rem <= OVERHEAD {
        anyhow::bail!(
            "ciphertext length {cipher_len} is invalid: trailing record of {rem} bytes (minimum {})",
            OVERHEAD + 1
        );
    }
    Ok(full * CHUNK_SIZE + rem - OVERHEAD)
}

/// Encrypt a whole value.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(encrypted_len(plaintext.len()));
    encrypt_into(key, plaintext, &mut out)?;
    Ok(out)
}

/// Encrypt a whole value, appending the records to `out`.
pub fn encrypt_into(key: &EncryptionKey, plaintext: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    out.reserve(encrypted_len(plaintext.len()));
    for (index, chunk) in plaintext.chunks(CHUNK_SIZE).enumerate() {
        seal_record(&cipher, counter(index)?, chunk, out)?;
    }
    Ok(())
}

/// Decrypt a whole value. Any record failing authentication fails the call.
pub fn decrypt(key: &EncryptionKey, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(decrypted_len(ciphertext.len())?);
    decrypt_into(key, ciphertext, &mut out)?;
    Ok(out)
}

/// Decrypt a whole value, appending plaintext to `out`.
///
/// On failure `out` is restored to its original length; no plaintext from a
/// partially verified value is left behind.
///
/// Truncation at a record boundary is not detected: the remaining records
/// authenticate and decrypt to a prefix of the original plaintext.
pub fn decrypt_into(key: &EncryptionKey, ciphertext: &[u8], out: &mut Vec<u8>) -> anyhow::Result<()> {
    let start = out.len();
    out.reserve(decrypted_len(ciphertext.len())?);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    for (index, record) in ciphertext.chunks(RECORD_SIZE).enumerate() {
        let opened = counter(index).and_then(|c| open_record(&cipher, c, record, out));
        if let Err(e) = opened {
            wipe_tail(out, start);
            return Err(e);
        }
    }
    Ok(())
}

fn counter(index: usize) -> anyhow::Result<u32> {
    u32::try_from(index).map_err(|_| anyhow::anyhow!("value too large: chunk counter overflow"))
}

fn seal_record(
    cipher: &XChaCha20Poly1305,
    counter: u32,
    chunk: &[u8],
    out: &mut Vec<u8>,
) -> anyhow::Result<()> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let aad = counter.to_le_bytes();
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: chunk,
                aad: &aad,
            },
        )
        .map_err(|e| anyhow::anyhow!("chunk {counter} encryption failed: {e}"))?;

    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(())
}

fn open_record(
    cipher: &XChaCha20Poly1305,
    counter: u32,
    record: &[u8],
    out: &mut Vec<u8>,
) -> anyhow::Result<()> {
    if record.len() <= OVERHEAD {
        anyhow::bail!(
            "encrypted chunk {counter} too short: {} bytes (minimum {})",
            record.len(),
            OVERHEAD + 1
        );
    }

    let (nonce_bytes, ciphertext) = record.split_at(NONCE_SIZE);
    let aad = counter.to_le_bytes();
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| anyhow::anyhow!("decryption failed: wrong key or tampered data"))?;

    out.extend_from_slice(&plaintext);
    Ok(())
}

fn wipe_tail(out: &mut Vec<u8>, start: usize) {
    use zeroize::Zeroize;
    out[start..].zeroize();
    out.truncate(start);
}

/// Streaming encryptor over any [`Write`] sink.
///
/// Plaintext is buffered until a full chunk is available. Call
/// [`EncryptWriter::finish`] to seal the trailing short chunk; dropping the
/// writer without finishing loses it.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: XChaCha20Poly1305,
    pending: Vec<u8>,
    next: usize,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(key: &EncryptionKey, inner: W) -> Self {
        Self {
            inner,
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            pending: Vec::with_capacity(CHUNK_SIZE),
            next: 0,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        let mut record = Vec::with_capacity(self.pending.len() + OVERHEAD);
        let counter = counter(self.next).map_err(io::Error::other)?;
        seal_record(&self.cipher, counter, &self.pending, &mut record).map_err(io::Error::other)?;
        self.inner.write_all(&record)?;
        self.pending.clear();
        self.next += 1;
        Ok(())
    }

    /// Seal any buffered plaintext and return the sink.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() {
            self.emit()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = buf.len().min(CHUNK_SIZE - self.pending.len());
        self.pending.extend_from_slice(&buf[..take]);
        if self.pending.len() == CHUNK_SIZE {
            self.emit()?;
        }
        Ok(take)
    }

    /// Flushes the sink only; a partial chunk stays buffered so record
    /// boundaries match [`encrypt`].
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streaming decryptor over any [`Read`] source.
///
/// Each record is authenticated before any of its plaintext is returned.
/// Authentication failures surface as `InvalidData`. A source that ends on a
/// record boundary reads as a clean end of stream, even if records were cut.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: XChaCha20Poly1305,
    plain: Vec<u8>,
    pos: usize,
    next: usize,
    eof: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(key: &EncryptionKey, inner: R) -> Self {
        Self {
            inner,
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            plain: Vec::with_capacity(CHUNK_SIZE),
            pos: 0,
            next: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        let mut record = vec![0u8; RECORD_SIZE];
        let mut filled = 0;
        while filled < RECORD_SIZE {
            match self.inner.read(&mut record[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled < RECORD_SIZE {
            self.eof = true;
        }
        if filled == 0 {
            return Ok(());
        }

        self.plain.clear();
        self.pos = 0;
        let counter = counter(self.next).map_err(io::Error::other)?;
        open_record(&self.cipher, counter, &record[..filled], &mut self.plain)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.next += 1;
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos == self.plain.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
            if self.pos == self.plain.len() {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
