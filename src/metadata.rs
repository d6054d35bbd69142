//! The `sops` metadata record stored alongside encrypted values.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::error::{Result, SealError};
use crate::keysource::{self, KeyServices, KeySource, MasterKey, KEY_SOURCE_NAMES};
use crate::mac::format_timestamp;
use crate::scope::EncryptionScope;

/// Reserved top-level key holding the metadata.
pub const METADATA_KEY: &str = "sops";

/// Version written into new documents.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct Metadata {
    pub version: String,
    pub scope: EncryptionScope,
    /// Encrypted MAC envelope. Empty until the first save.
    pub message_authentication_code: String,
    pub last_modified: DateTime<Utc>,
    pub key_sources: Vec<KeySource>,
}

impl Metadata {
    pub fn new(key_sources: Vec<KeySource>, scope: EncryptionScope) -> Self {
        Self {
            version: VERSION.to_string(),
            scope,
            message_authentication_code: String::new(),
            last_modified: keysource::now_seconds(),
            key_sources,
        }
    }

    /// Stamp the record with the current time, truncated to seconds.
    pub fn touch(&mut self) {
        self.last_modified = keysource::now_seconds();
    }

    pub fn master_keys(&self) -> impl Iterator<Item = &Box<dyn MasterKey>> {
        self.key_sources.iter().flat_map(|s| s.keys.iter())
    }

    /// True if any master key's wrapped copy is due for rotation.
    pub fn needs_rotation(&self) -> bool {
        self.master_keys().any(|k| k.needs_rotation())
    }

    /// Serialize to the map stored under [`METADATA_KEY`].
    pub fn to_map(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        for name in KEY_SOURCE_NAMES {
            let entries: Vec<JsonValue> = self
                .master_keys()
                .filter(|k| k.type_identifier() == name)
                .map(|k| JsonValue::Object(k.to_map()))
                .collect();
            if !entries.is_empty() {
                out.insert(name.to_string(), JsonValue::Array(entries));
            }
        }
        out.insert(
            "lastmodified".into(),
            JsonValue::String(format_timestamp(&self.last_modified)),
        );
        out.insert(
            "mac".into(),
            JsonValue::String(self.message_authentication_code.clone()),
        );
        out.insert(
            self.scope.metadata_key().into(),
            JsonValue::String(self.scope.pattern().to_string()),
        );
        out.insert("version".into(), JsonValue::String(self.version.clone()));
        out
    }

    /// Parse the map stored under [`METADATA_KEY`].
    ///
    /// Malformed entries fail the whole parse. A missing MAC only warns, so
    /// that verification fails later with a clear mismatch.
    pub fn from_map(map: &Map<String, JsonValue>, services: &KeyServices) -> Result<Self> {
        let version = match map.get("version") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            None => return Err(SealError::InvalidMetadata("missing version".into())),
            Some(other) => {
                return Err(SealError::InvalidMetadata(format!(
                    "version must be a string or number, got {other}"
                )))
            }
        };

        let scope = EncryptionScope::from_fields(
            scope_field(map, "unencrypted_suffix")?,
            scope_field(map, "encrypted_suffix")?,
            scope_field(map, "unencrypted_regex")?,
            scope_field(map, "encrypted_regex")?,
        )
        .map_err(|e| match e {
            SealError::Config(reason) => SealError::InvalidMetadata(reason),
            other => other,
        })?;

        let message_authentication_code = match map.get("mac") {
            Some(JsonValue::String(mac)) => mac.clone(),
            _ => {
                warn!("no MAC was found on the input file; verification will fail");
                String::new()
            }
        };

        let last_modified = match map.get("lastmodified").and_then(JsonValue::as_str) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| SealError::InvalidMetadata(format!("invalid lastmodified '{raw}': {e}")))?,
            None => return Err(SealError::InvalidMetadata("missing lastmodified".into())),
        };

        let mut key_sources = Vec::new();
        for name in KEY_SOURCE_NAMES {
            let entries = match map.get(name) {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::Array(entries)) => entries,
                Some(_) => {
                    return Err(SealError::InvalidMetadata(format!("{name} must be a list")))
                }
            };
            let keys = entries
                .iter()
                .map(|entry| match entry {
                    JsonValue::Object(entry) => services.master_key_from_map(name, entry),
                    _ => Err(SealError::InvalidMetadata(format!(
                        "{name} entries must be maps"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?;
            if !keys.is_empty() {
                key_sources.push(KeySource::new(name, keys));
            }
        }

        Ok(Self {
            version,
            scope,
            message_authentication_code,
            last_modified,
            key_sources,
        })
    }
}

fn scope_field<'a>(map: &'a Map<String, JsonValue>, name: &str) -> Result<Option<&'a str>> {
    match map.get(name) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(SealError::InvalidMetadata(format!("{name} must be a string"))),
    }
}
