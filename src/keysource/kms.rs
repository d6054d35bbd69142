//! AWS KMS master keys.
//!
//! The network call is delegated to a [`KmsClient`] so the crate does not
//! pull in an AWS SDK. The wrapped data key is stored base64 encoded.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tracing::info;

use super::{
    decryption_error, encryption_error, format_created_at, now_seconds, older_than_ttl, optional_str,
    parse_created_at, required_str, KeyServices, MasterKey,
};
use crate::error::{Result, SealError};
use crate::keys::DataKey;

pub const KEY_TYPE: &str = "kms";

const ROLE_MARKER: &str = "+arn:aws:iam::";

fn arn_regex() -> &'static Regex {
    static ARN: OnceLock<Regex> = OnceLock::new();
    ARN.get_or_init(|| {
        Regex::new(r"^arn:aws[\w-]*:kms:(.+):[0-9]+:(key|alias)/.+$")
            .unwrap_or_else(|e| panic!("ARN pattern is a valid regex: {e}"))
    })
}

/// One Encrypt or Decrypt call against KMS.
#[derive(Debug, Clone, Copy)]
pub struct KmsRequest<'a> {
    pub key_arn: &'a str,
    pub region: &'a str,
    pub role: Option<&'a str>,
    pub aws_profile: Option<&'a str>,
    pub encryption_context: &'a BTreeMap<String, String>,
    /// Plaintext data key on encrypt, ciphertext blob on decrypt.
    pub payload: &'a [u8],
    pub timeout: Duration,
}

/// Minimal KMS API surface.
pub trait KmsClient: Send + Sync {
    fn encrypt(&self, request: &KmsRequest<'_>) -> Result<Vec<u8>>;
    fn decrypt(&self, request: &KmsRequest<'_>) -> Result<Vec<u8>>;
}

#[derive(Clone)]
pub struct KmsMasterKey {
    pub arn: String,
    pub role: Option<String>,
    pub encryption_context: BTreeMap<String, String>,
    pub aws_profile: Option<String>,
    pub encrypted_key: String,
    pub creation_date: DateTime<Utc>,
    client: Option<Arc<dyn KmsClient>>,
    timeout: Duration,
}

impl fmt::Debug for KmsMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KmsMasterKey")
            .field("arn", &self.arn)
            .field("role", &self.role)
            .field("encryption_context", &self.encryption_context)
            .field("aws_profile", &self.aws_profile)
            .field("creation_date", &self.creation_date)
            .field("wrapped", &!self.encrypted_key.is_empty())
            .finish()
    }
}

impl fmt::Display for KmsMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arn)
    }
}

impl KmsMasterKey {
    /// Build a key from `arn` or the `arn+role_arn` shorthand.
    pub fn from_arn(
        arn: &str,
        encryption_context: BTreeMap<String, String>,
        aws_profile: Option<&str>,
        services: &KeyServices,
    ) -> Result<Self> {
        let arn: String = arn.chars().filter(|c| !c.is_whitespace()).collect();
        let (arn, role) = match arn.find(ROLE_MARKER) {
            Some(index) if index > 0 => (arn[..index].to_string(), Some(arn[index + 1..].to_string())),
            _ => (arn, None),
        };
        validate_arn(&arn)?;
        Ok(Self {
            arn,
            role,
            encryption_context,
            aws_profile: aws_profile.map(str::to_string),
            encrypted_key: String::new(),
            creation_date: now_seconds(),
            client: services.kms_client(),
            timeout: services.timeout(),
        })
    }

    pub(crate) fn from_map(entry: &Map<String, JsonValue>, services: &KeyServices) -> Result<Self> {
        let arn = required_str(entry, "arn", KEY_TYPE)?.to_string();
        validate_arn(&arn)?;
        let encryption_context = match entry.get("context") {
            None | Some(JsonValue::Null) => BTreeMap::new(),
            Some(JsonValue::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|v| (k.clone(), v.to_string()))
                        .ok_or_else(|| {
                            SealError::InvalidMetadata(format!(
                                "kms context value for '{k}' is not a string"
                            ))
                        })
                })
                .collect::<Result<_>>()?,
            Some(JsonValue::String(s)) => parse_context(s)?,
            Some(_) => {
                return Err(SealError::InvalidMetadata(
                    "kms context must be a map".into(),
                ))
            }
        };
        Ok(Self {
            arn,
            role: optional_str(entry, "role").map(str::to_string),
            encryption_context,
            aws_profile: optional_str(entry, "aws_profile").map(str::to_string),
            encrypted_key: required_str(entry, "enc", KEY_TYPE)?.to_string(),
            creation_date: parse_created_at(entry, KEY_TYPE)?,
            client: services.kms_client(),
            timeout: services.timeout(),
        })
    }

    fn region(&self) -> Result<&str> {
        arn_regex()
            .captures(&self.arn)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| SealError::InvalidMasterKey(format!("no valid ARN found in '{}'", self.arn)))
    }

    fn client(&self) -> Result<&Arc<dyn KmsClient>> {
        self.client
            .as_ref()
            .ok_or_else(|| SealError::InvalidMasterKey("no KMS client configured".into()))
    }

    fn request<'a>(&'a self, region: &'a str, payload: &'a [u8]) -> KmsRequest<'a> {
        KmsRequest {
            key_arn: &self.arn,
            region,
            role: self.role.as_deref(),
            aws_profile: self.aws_profile.as_deref(),
            encryption_context: &self.encryption_context,
            payload,
            timeout: self.timeout,
        }
    }
}

/// Parse a `key:value,key:value` encryption context.
pub fn parse_context(input: &str) -> Result<BTreeMap<String, String>> {
    let mut context = BTreeMap::new();
    for pair in input.split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair.split_once(':').ok_or_else(|| {
            SealError::InvalidMasterKey(format!("invalid encryption context entry '{pair}'"))
        })?;
        if value.contains(':') {
            return Err(SealError::InvalidMasterKey(format!(
                "invalid encryption context entry '{pair}'"
            )));
        }
        context.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(context)
}

fn validate_arn(arn: &str) -> Result<()> {
    if arn_regex().is_match(arn) {
        Ok(())
    } else {
        Err(SealError::InvalidMasterKey(format!("no valid ARN found in '{arn}'")))
    }
}

impl MasterKey for KmsMasterKey {
    fn encrypt(&mut self, data_key: &DataKey) -> Result<()> {
        let region = self.region()?;
        let blob = self
            .client()?
            .encrypt(&self.request(region, data_key.as_bytes()))
            .map_err(|e| encryption_error(&self.arn, e))?;
        self.encrypted_key = STANDARD.encode(blob);
        info!(arn = %self.arn, "encryption succeeded");
        Ok(())
    }

    fn decrypt(&self) -> Result<DataKey> {
        let blob = STANDARD.decode(&self.encrypted_key).map_err(|e| SealError::KeyDecryption {
            key: self.arn.clone(),
            reason: format!("error base64-decoding encrypted data key: {e}"),
        })?;
        let region = self.region()?;
        let plaintext = self
            .client()?
            .decrypt(&self.request(region, &blob))
            .map_err(|e| decryption_error(&self.arn, e))?;
        info!(arn = %self.arn, "decryption succeeded");
        DataKey::from_slice(&plaintext)
    }

    fn needs_rotation(&self) -> bool {
        older_than_ttl(&self.creation_date)
    }

    fn to_map(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        out.insert("arn".into(), JsonValue::String(self.arn.clone()));
        if let Some(role) = &self.role {
            out.insert("role".into(), JsonValue::String(role.clone()));
        }
        if !self.encryption_context.is_empty() {
            let context = self
                .encryption_context
                .iter()
                .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
                .collect();
            out.insert("context".into(), JsonValue::Object(context));
        }
        out.insert("created_at".into(), format_created_at(&self.creation_date));
        out.insert("enc".into(), JsonValue::String(self.encrypted_key.clone()));
        if let Some(profile) = &self.aws_profile {
            out.insert("aws_profile".into(), JsonValue::String(profile.clone()));
        }
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
