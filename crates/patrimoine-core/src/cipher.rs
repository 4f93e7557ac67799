//! Key derivation and authenticated encryption primitives.
//!
//! Envelope wire format:
//!   [ format (1 byte) | nonce (24 bytes) | ciphertext + tag (16 bytes) ]
//!
//! The associated data binds an envelope to its use: a field blob cannot be
//! replayed as a backup container and vice versa.

use chacha20poly1305::aead::{Aead, KeyInit, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::corruption::DecodeFault;
use crate::error::{Result, VaultError};

pub const FORMAT_V1: u8 = 0x01;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const SECRET_LEN: usize = 32;
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

pub const FIELD_AAD: &[u8] = b"patrimoine-field-v1";
pub const BACKUP_AAD: &[u8] = b"patrimoine-backup-v1";

const HEADER_LEN: usize = 1 + NONCE_LEN;

/// PBKDF2-HMAC-SHA256 over `secret` and `salt`.
pub fn derive_key(secret: &[u8], salt: &[u8], iterations: u32) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(secret, salt, iterations, &mut key[..]);
    key
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_secret() -> Zeroizing<[u8; SECRET_LEN]> {
    let mut secret = Zeroizing::new([0u8; SECRET_LEN]);
    OsRng.fill_bytes(&mut secret[..]);
    secret
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key`, returning a versioned envelope with a
/// fresh random nonce.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| VaultError::InvalidKey("key must be 32 bytes".into()))?;
    let nonce = generate_nonce();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::Encryption)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.push(FORMAT_V1);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an envelope produced by [`seal`]. Any bit flip in the format
/// byte, nonce, ciphertext or tag is rejected.
pub fn open(
    key: &[u8; KEY_LEN],
    envelope: &[u8],
    aad: &[u8],
) -> std::result::Result<Zeroizing<Vec<u8>>, DecodeFault> {
    if envelope.len() < HEADER_LEN + TAG_LEN {
        return Err(DecodeFault::Truncated {
            len: envelope.len(),
        });
    }
    if envelope[0] != FORMAT_V1 {
        return Err(DecodeFault::UnknownFormat(envelope[0]));
    }
    let (nonce, ciphertext) = envelope[1..].split_at(NONCE_LEN);
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|_| DecodeFault::Authentication)?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| DecodeFault::Authentication)?;
    Ok(Zeroizing::new(plaintext))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
