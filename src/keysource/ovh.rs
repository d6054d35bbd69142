//! OVHcloud KMS master keys.
//!
//! Keys are written as `<endpoint>/<key id>`, where the key id is a UUID.
//! The data key is base64 encoded before it is sent to the service, and the
//! service's ciphertext is stored as returned.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tracing::info;
use uuid::Uuid;

use super::{
    decryption_error, encryption_error, format_created_at, now_seconds, older_than_ttl, parse_created_at,
    required_str, KeyServices, MasterKey,
};
use crate::error::{Result, SealError};
use crate::keys::DataKey;

pub const KEY_TYPE: &str = "ovh_kms";

fn key_id_regex() -> &'static Regex {
    static KEY_ID: OnceLock<Regex> = OnceLock::new();
    KEY_ID.get_or_init(|| {
        Regex::new(r"^([^/]+)/([^/]+)$").unwrap_or_else(|e| panic!("key id pattern is a valid regex: {e}"))
    })
}

/// Minimal OVH KMS API surface.
pub trait OvhKmsClient: Send + Sync {
    /// Encrypt `plaintext` with the key, returning the service's ciphertext.
    fn encrypt(&self, endpoint: &str, key_id: Uuid, plaintext: &[u8], timeout: Duration) -> Result<String>;

    /// Decrypt a ciphertext previously returned by [`OvhKmsClient::encrypt`].
    fn decrypt(&self, endpoint: &str, key_id: Uuid, ciphertext: &str, timeout: Duration) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct OvhKmsMasterKey {
    pub endpoint: String,
    pub key_id: String,
    pub encrypted_key: String,
    pub creation_date: DateTime<Utc>,
    client: Option<Arc<dyn OvhKmsClient>>,
    timeout: Duration,
}

impl fmt::Debug for OvhKmsMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OvhKmsMasterKey")
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .field("creation_date", &self.creation_date)
            .field("wrapped", &!self.encrypted_key.is_empty())
            .finish()
    }
}

impl fmt::Display for OvhKmsMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint, self.key_id)
    }
}

impl OvhKmsMasterKey {
    /// Parse `<endpoint>/<key id>`.
    pub fn from_key_id(key_id: &str, services: &KeyServices) -> Result<Self> {
        let captures = key_id_regex().captures(key_id).ok_or_else(|| {
            SealError::InvalidMasterKey(format!(
                "not a valid key (should look like example.okms.ovh.net/<key id>), got: {key_id}"
            ))
        })?;
        Ok(Self {
            endpoint: captures[1].to_string(),
            key_id: captures[2].to_string(),
            encrypted_key: String::new(),
            creation_date: now_seconds(),
            client: services.ovh_client(),
            timeout: services.timeout(),
        })
    }

    pub(crate) fn from_map(entry: &Map<String, JsonValue>, services: &KeyServices) -> Result<Self> {
        Ok(Self {
            endpoint: required_str(entry, "endpoint", KEY_TYPE)?.to_string(),
            key_id: required_str(entry, "key_id", KEY_TYPE)?.to_string(),
            encrypted_key: required_str(entry, "enc", KEY_TYPE)?.to_string(),
            creation_date: parse_created_at(entry, KEY_TYPE)?,
            client: services.ovh_client(),
            timeout: services.timeout(),
        })
    }

    fn uuid(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.key_id)
            .map_err(|e| SealError::InvalidMasterKey(format!("failed to parse UUID '{}': {e}", self.key_id)))
    }

    fn client(&self) -> Result<&Arc<dyn OvhKmsClient>> {
        self.client
            .as_ref()
            .ok_or_else(|| SealError::InvalidMasterKey("no OVH KMS client configured".into()))
    }
}

impl MasterKey for OvhKmsMasterKey {
    fn encrypt(&mut self, data_key: &DataKey) -> Result<()> {
        let key_id = self.uuid()?;
        let plaintext = STANDARD.encode(data_key.as_bytes());
        let ciphertext = self
            .client()?
            .encrypt(&self.endpoint, key_id, plaintext.as_bytes(), self.timeout)
            .map_err(|e| encryption_error(&self.to_string(), e))?;
        self.encrypted_key = ciphertext;
        info!(key_id = %self.key_id, "encryption succeeded");
        Ok(())
    }

    fn decrypt(&self) -> Result<DataKey> {
        let key_id = self.uuid()?;
        let encoded = self
            .client()?
            .decrypt(&self.endpoint, key_id, &self.encrypted_key, self.timeout)
            .map_err(|e| decryption_error(&self.to_string(), e))?;
        let plaintext = STANDARD.decode(&encoded).map_err(|e| SealError::KeyDecryption {
            key: self.to_string(),
            reason: format!("failed to decode base64 plaintext: {e}"),
        })?;
        info!(key_id = %self.key_id, "decryption succeeded");
        DataKey::from_slice(&plaintext)
    }

    fn needs_rotation(&self) -> bool {
        older_than_ttl(&self.creation_date)
    }

    fn to_map(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        out.insert("endpoint".into(), JsonValue::String(self.endpoint.clone()));
        out.insert("key_id".into(), JsonValue::String(self.key_id.clone()));
        out.insert("enc".into(), JsonValue::String(self.encrypted_key.clone()));
        out.insert("created_at".into(), format_created_at(&self.creation_date));
        out
    }

    fn type_identifier(&self) -> &'static str {
        KEY_TYPE
    }

    fn encrypted_data_key(&self) -> &str {
        &self.encrypted_key
    }

    fn set_encrypted_data_key(&mut self, enc: String) {
        self.encrypted_key = enc;
    }

    fn box_clone(&self) -> Box<dyn MasterKey> {
        Box::new(self.clone())
    }
}
