//! Low-level cryptographic operations.
//!
//! This is the only module in the crate that imports `ring` directly. All
//! other modules encrypt, decrypt and hash exclusively through the functions
//! exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption with associated data)
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Tag**: 128-bit, kept detached from the ciphertext
//! - **Key size**: 256 bits (32 bytes)
//! - **Digest**: SHA-512

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::SealError;

/// The AEAD algorithm used throughout sealtree.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Size of a data key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Output of a single AES-256-GCM seal with the tag split off.
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub tag: [u8; TAG_LEN],
}

/// Generate a cryptographically secure random nonce.
///
/// A fresh nonce is generated for every encryption call. There is no nonce
/// caching or counter-based generation.
fn generate_nonce() -> Result<[u8; NONCE_LEN], SealError> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; NONCE_LEN];
    rng.fill(&mut buf).map_err(|_| SealError::RandomnessFailure)?;
    Ok(buf)
}

fn less_safe_key(key_bytes: &[u8; KEY_LEN]) -> Result<LessSafeKey, SealError> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| SealError::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` with AES-256-GCM, authenticating `aad` alongside it.
///
/// The nonce and tag are returned separately because the envelope format
/// stores them in their own fields.
pub fn seal(key_bytes: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, SealError> {
    let key = less_safe_key(key_bytes)?;
    let nonce_bytes = generate_nonce()?;

    let mut ciphertext = plaintext.to_vec();
    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::from(aad),
            &mut ciphertext,
        )
        .map_err(|_| SealError::EncryptionFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_ref());

    Ok(Sealed {
        ciphertext,
        nonce: nonce_bytes,
        tag: tag_bytes,
    })
}

/// Decrypt a detached AES-256-GCM payload.
///
/// If the key is wrong, the AAD differs from the one used at seal time, or the
/// bytes were tampered with, the tag check fails and no partial plaintext is
/// returned.
pub fn open(
    key_bytes: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    aad: &[u8],
) -> Result<Vec<u8>, SealError> {
    let key = less_safe_key(key_bytes)?;

    let mut payload = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    payload.extend_from_slice(ciphertext);
    payload.extend_from_slice(tag);

    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(*nonce), Aad::from(aad), &mut payload)
        .map_err(|_| SealError::DecryptionFailure)?;

    Ok(plaintext.to_vec())
}

/// Generate a cryptographically secure random key.
///
/// This is the only function in the crate that produces raw key material from
/// scratch.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], SealError> {
    let rng = SystemRandom::new();
    let mut key = [0u8; KEY_LEN];
    rng.fill(&mut key).map_err(|_| SealError::RandomnessFailure)?;
    Ok(key)
}

/// Incremental SHA-512 hasher.
pub struct Sha512 {
    context: digest::Context,
}

impl Sha512 {
    pub fn new() -> Self {
        Self {
            context: digest::Context::new(&digest::SHA512),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.context.update(bytes);
    }

    pub fn finish(self) -> Vec<u8> {
        self.context.finish().as_ref().to_vec()
    }
}

impl Default for Sha512 {
    fn default() -> Self {
        Self::new()
    }
}
