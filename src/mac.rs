//! Whole-document message authentication code.
//!
//! Every visited scalar's plaintext bytes, encrypted or not, go through one
//! SHA-512 accumulator in walk order. The upper-case hex digest is itself
//! encrypted with the data key, using the document's `lastmodified`
//! timestamp as AAD.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::cipher;
use crate::crypto::Sha512;
use crate::error::{Result, SealError};
use crate::keys::DataKey;
use crate::tree::Scalar;

/// Streaming MAC over a document's plaintext values.
pub struct MacAccumulator {
    hasher: Sha512,
}

impl MacAccumulator {
    pub fn new() -> Self {
        Self {
            hasher: Sha512::new(),
        }
    }

    /// Feed one scalar. `Null` contributes nothing.
    pub fn update(&mut self, scalar: &Scalar) {
        if let Some(bytes) = scalar.to_bytes() {
            self.hasher.update(&bytes);
        }
    }

    /// Finish and render the digest as upper-case hex.
    pub fn finish(self) -> String {
        hex::encode_upper(self.hasher.finish())
    }
}

impl Default for MacAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 3339 with second precision, as stored in metadata.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Encrypt a MAC for storage in metadata.
pub fn encrypt_mac(mac: &str, key: &DataKey, last_modified: &DateTime<Utc>) -> Result<String> {
    cipher::encrypt(&Scalar::from(mac), key, &format_timestamp(last_modified))
}

/// Decrypt a stored MAC.
pub fn decrypt_mac(stored: &str, key: &DataKey, last_modified: &DateTime<Utc>) -> Result<String> {
    let aad = format_timestamp(last_modified);
    match cipher::decrypt(stored, key, &aad) {
        Ok(Scalar::String(mac)) => Ok(mac),
        Ok(_) => Err(SealError::InvalidMetadata("stored MAC is not a string".into())),
        Err(SealError::AuthenticationFailure { .. }) => Err(SealError::AuthenticationFailure {
            path: "sops:mac".into(),
        }),
        Err(err) => Err(err),
    }
}

/// Compare two MACs in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check a computed MAC against the stored one.
pub fn verify(stored: &str, computed: &str) -> Result<()> {
    if constant_time_eq(stored, computed) {
        Ok(())
    } else {
        Err(SealError::MacMismatch {
            stored: stored.to_string(),
            computed: computed.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_digest_is_upper_hex() {
        let mut mac = MacAccumulator::new();
        mac.update(&Scalar::from("abc"));
        let digest = mac.finish();
        assert_eq!(digest.len(), 128);
        assert!(digest.starts_with("DDAF35A193617ABA"));
    }

    #[test]
    fn test_null_contributes_nothing() {
        let mut a = MacAccumulator::new();
        a.update(&Scalar::from("x"));
        let mut b = MacAccumulator::new();
        b.update(&Scalar::from("x"));
        b.update(&Scalar::Null);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn test_mac_bound_to_timestamp() {
        let key = DataKey::from_bytes([5u8; 32]);
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let sealed = encrypt_mac("ABC", &key, &t1).unwrap();
        assert_eq!(decrypt_mac(&sealed, &key, &t1).unwrap(), "ABC");
        assert!(matches!(
            decrypt_mac(&sealed, &key, &t2),
            Err(SealError::AuthenticationFailure { .. })
        ));
    }

    #[test]
    fn test_verify() {
        assert!(verify("AA", "AA").is_ok());
        assert!(matches!(verify("AA", "AB"), Err(SealError::MacMismatch { .. })));
        assert!(!constant_time_eq("AA", "AAA"));
    }

    #[test]
    fn test_timestamp_format() {
        let t = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(format_timestamp(&t), "2024-03-04T05:06:07Z");
    }
}
