//! Error types for sealtree.
//!
//! Every variant is a distinct failure mode of loading, encrypting,
//! decrypting or rotating a document. Messages say *what* failed; key
//! material and plaintext values never appear in them.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// One master key that could not wrap or unwrap the data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    /// Backend identifier of the key (`kms`, `pgp`, ...).
    pub key_type: String,
    /// Human readable key identity (ARN, fingerprint, recipient, ...).
    pub key: String,
    /// Why the backend call failed.
    pub reason: String,
}

impl fmt::Display for KeyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.key_type, self.key, self.reason)
    }
}

fn render_failures(failures: &[KeyFailure]) -> String {
    if failures.is_empty() {
        return "\tno master keys configured".to_string();
    }
    failures
        .iter()
        .map(|failure| format!("\t{failure}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The single error type for all sealtree operations.
#[derive(Debug, Error)]
pub enum SealError {
    /// A data key had the wrong length or was otherwise unusable.
    #[error("invalid key")]
    InvalidKey,

    /// The `ring` sealing operation failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// Low-level AEAD open failed: wrong key, wrong AAD or tampered bytes.
    /// Surfaced to callers as `AuthenticationFailure` once the path is known.
    #[error("decryption failed")]
    DecryptionFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// The input document could not be parsed.
    #[error("could not parse document: {0}")]
    Parse(String),

    /// The document carries no metadata key. It is possibly plaintext.
    #[error("sops metadata not found")]
    MetadataNotFound,

    /// The metadata record is present but malformed.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// A value looked like an encrypted envelope but could not be parsed.
    #[error("malformed encrypted value: {0}")]
    MalformedEnvelope(String),

    /// The GCM tag did not verify for the value at `path`.
    #[error("authentication failed for value at '{path}'")]
    AuthenticationFailure { path: String },

    /// The recomputed document MAC differs from the stored one.
    #[error("MAC mismatch: file has {stored}, computed {computed}")]
    MacMismatch { stored: String, computed: String },

    /// A single master key failed to unwrap the data key.
    #[error("failed to decrypt data key with {key}: {reason}")]
    KeyDecryption { key: String, reason: String },

    /// A single master key failed to wrap the data key.
    #[error("failed to encrypt data key with {key}: {reason}")]
    KeyEncryption { key: String, reason: String },

    /// Every configured master key failed to unwrap the data key.
    #[error("could not decrypt the data key with any of the master keys:\n{}", render_failures(.0))]
    NoMasterKeyAvailable(Vec<KeyFailure>),

    /// At least one master key failed to wrap the data key during a save.
    #[error("could not encrypt the data key with every master key:\n{}", render_failures(.0))]
    KeyWrap(Vec<KeyFailure>),

    /// A master key definition (ARN, fingerprint, recipient...) is invalid.
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),

    /// The tree holds a value that cannot be encrypted or serialized.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A key service call exceeded its deadline.
    #[error("key service call timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SealError>;
