//! # sealtree
//!
//! Structure-preserving encryption for configuration documents.
//!
//! Every scalar value of a document is encrypted on its own with AES-256-GCM,
//! bound to its key path, while keys and layout stay readable. One random
//! data key encrypts all values; it is wrapped by any number of master keys
//! (AWS KMS, PGP, OVH KMS, age) and any one of them can recover it. A SHA-512
//! MAC over all plaintext values detects tampering with the document as a
//! whole.
//!
//! ## Public API
//!
//! [`Document`] and the free functions in [`document`] are the entry points.
//! Key services are configured once in a [`KeyServices`] and passed to every
//! operation that has to build master keys from stored metadata.

// Module declarations.
pub mod audit;
pub mod cipher;
pub mod config;
pub(crate) mod crypto;
pub mod document;
pub mod error;
pub mod keys;
pub mod keysource;
pub mod mac;
pub mod metadata;
pub mod scope;
pub mod store;
pub mod tree;

pub use audit::{AuditEvent, AuditLog, AuditRecord, AuditSink, FileAuditSink};
pub use config::{CreationRule, SealConfig};
pub use document::{decrypt, encrypt, rotate, Document, KeyChanges, Options};
pub use error::{KeyFailure, Result, SealError};
pub use keys::DataKey;
pub use keysource::{KeyServices, KeySource, MasterKey};
pub use metadata::Metadata;
pub use scope::EncryptionScope;
pub use store::{DotenvStore, Format, JsonStore, Store};
pub use tree::{PathSegment, Scalar, TreeBranch, TreeItem, TreeKey, Value};

/// Generate a fresh random data key.
///
/// Documents normally get their data key from [`encrypt`]; this is for
/// callers driving [`Document::encrypt`] themselves.
pub fn generate_data_key() -> Result<DataKey> {
    DataKey::generate()
}
