//! Data key ownership.
//!
//! The data key is the single symmetric secret that encrypts every value of a
//! document and its MAC. It is:
//!
//! - Not `Clone`. It cannot be duplicated without explicit conversion.
//! - Zeroised on drop. Memory is overwritten before deallocation.
//! - Never serialized. Only master keys' wrapped copies are persisted.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{self, KEY_LEN};
use crate::error::SealError;

/// A 256-bit data key scoped to one document operation.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    /// Generate a fresh random data key.
    pub fn generate() -> Result<Self, SealError> {
        crypto::generate_random_key().map(Self::from_bytes)
    }

    /// Construct a `DataKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Construct a `DataKey` from a slice returned by a key backend.
    ///
    /// Fails with `InvalidKey` unless the slice is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SealError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| SealError::InvalidKey)?;
        Ok(Self { bytes })
    }

    /// Borrow the raw key bytes.
    ///
    /// Master key backends need the bytes to wrap them; nothing else should.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}
