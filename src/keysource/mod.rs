//! Master keys and key sources.
//!
//! A master key wraps the document's data key with an external secret:
//! a KMS key, a PGP key, an age recipient. A document lists its master keys
//! grouped by backend. Any single one of them is enough to recover the data
//! key; saving requires all of them to wrap it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::error::{KeyFailure, Result, SealError};
use crate::keys::DataKey;

pub mod age;
pub mod kms;
pub mod ovh;
pub mod pgp;

pub use self::age::AgeMasterKey;
pub use self::kms::{KmsClient, KmsMasterKey, KmsRequest};
pub use self::ovh::{OvhKmsClient, OvhKmsMasterKey};
pub use self::pgp::{GnuPgBackend, PgpBackend, PgpMasterKey};

/// Default deadline for a single key service call.
pub const DEFAULT_KEY_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a wrapped copy may age before rotation is recommended.
pub(crate) const ROTATION_TTL_DAYS: i64 = 180;

/// A backend able to wrap and unwrap the data key.
pub trait MasterKey: fmt::Display + fmt::Debug + Send + Sync {
    /// Wrap `data_key` and store the result on the key.
    fn encrypt(&mut self, data_key: &DataKey) -> Result<()>;

    /// Wrap `data_key` only if no wrapped copy is held yet.
    fn encrypt_if_needed(&mut self, data_key: &DataKey) -> Result<()> {
        if self.encrypted_data_key().is_empty() {
            self.encrypt(data_key)
        } else {
            Ok(())
        }
    }

    /// Unwrap the stored copy.
    fn decrypt(&self) -> Result<DataKey>;

    fn needs_rotation(&self) -> bool;

    /// Serialized form stored in metadata.
    fn to_map(&self) -> Map<String, JsonValue>;

    /// Backend identifier: the metadata field this key is listed under.
    fn type_identifier(&self) -> &'static str;

    fn encrypted_data_key(&self) -> &str;

    fn set_encrypted_data_key(&mut self, enc: String);

    fn clear_encrypted_data_key(&mut self) {
        self.set_encrypted_data_key(String::new());
    }

    fn box_clone(&self) -> Box<dyn MasterKey>;
}

impl Clone for Box<dyn MasterKey> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Master keys of one backend, in document order.
#[derive(Debug, Clone)]
pub struct KeySource {
    pub name: String,
    pub keys: Vec<Box<dyn MasterKey>>,
}

impl KeySource {
    pub fn new(name: impl Into<String>, keys: Vec<Box<dyn MasterKey>>) -> Self {
        Self {
            name: name.into(),
            keys,
        }
    }
}

fn failure(key: &dyn MasterKey, err: &SealError) -> KeyFailure {
    KeyFailure {
        key_type: key.type_identifier().to_string(),
        key: key.to_string(),
        reason: err.to_string(),
    }
}

/// Recover the data key with the first master key that works.
///
/// Keys are tried source by source, in order. Every failure is logged and
/// audited; only when all keys fail is an error returned, listing them all.
pub fn get_data_key(sources: &[KeySource], audit: &mut AuditLog) -> Result<DataKey> {
    let mut failures = Vec::new();
    for source in sources {
        for key in &source.keys {
            match key.decrypt() {
                Ok(data_key) => {
                    info!(key_type = key.type_identifier(), key = %key, "data key retrieved");
                    audit.record(AuditEvent::DataKeyRetrieved {
                        key_type: key.type_identifier().to_string(),
                        key: key.to_string(),
                    });
                    return Ok(data_key);
                }
                Err(err) => {
                    warn!(key_type = key.type_identifier(), key = %key, error = %err, "master key could not decrypt the data key");
                    let failure = failure(&**key, &err);
                    audit.record(AuditEvent::MasterKeyFailed {
                        key_type: failure.key_type.clone(),
                        key: failure.key.clone(),
                        reason: failure.reason.clone(),
                    });
                    failures.push(failure);
                }
            }
        }
    }
    Err(SealError::NoMasterKeyAvailable(failures))
}

fn wrap_all<F>(sources: &mut [KeySource], audit: &mut AuditLog, mut wrap: F) -> Result<()>
where
    F: FnMut(&mut dyn MasterKey) -> Result<()>,
{
    let mut failures = Vec::new();
    for source in sources.iter_mut() {
        for key in source.keys.iter_mut() {
            if let Err(err) = wrap(key.as_mut()) {
                warn!(key_type = key.type_identifier(), key = %key, error = %err, "master key could not encrypt the data key");
                let failure = failure(&**key, &err);
                audit.record(AuditEvent::MasterKeyFailed {
                    key_type: failure.key_type.clone(),
                    key: failure.key.clone(),
                    reason: failure.reason.clone(),
                });
                failures.push(failure);
            }
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(SealError::KeyWrap(failures))
    }
}

/// Wrap the data key with every master key, replacing existing copies.
///
/// All keys are attempted; the call fails if any of them failed.
pub fn update_master_keys(
    sources: &mut [KeySource],
    data_key: &DataKey,
    audit: &mut AuditLog,
) -> Result<()> {
    wrap_all(sources, audit, |key| key.encrypt(data_key))
}

/// Wrap the data key with the master keys that hold no wrapped copy yet.
pub fn update_master_keys_if_needed(
    sources: &mut [KeySource],
    data_key: &DataKey,
    audit: &mut AuditLog,
) -> Result<()> {
    wrap_all(sources, audit, |key| key.encrypt_if_needed(data_key))
}

/// Drop every wrapped copy so the next update wraps a new data key.
pub fn clear_wrapped_keys(sources: &mut [KeySource]) {
    for key in sources.iter_mut().flat_map(|s| s.keys.iter_mut()) {
        key.clear_encrypted_data_key();
    }
}

/// Append keys to the source called `source_name`, creating it if needed.
///
/// Every key must belong to the backend `source_name` names. Keys already
/// present (same string form) are skipped. Returns the string form of the
/// keys actually added.
pub fn add_master_keys(
    sources: &mut Vec<KeySource>,
    source_name: &str,
    keys: Vec<Box<dyn MasterKey>>,
) -> Result<Vec<String>> {
    if let Some(key) = keys.iter().find(|k| k.type_identifier() != source_name) {
        return Err(SealError::InvalidMasterKey(format!(
            "{} key {key} cannot be listed under '{source_name}'",
            key.type_identifier()
        )));
    }
    let index = match sources.iter().position(|s| s.name == source_name) {
        Some(index) => index,
        None => {
            sources.push(KeySource::new(source_name, Vec::new()));
            sources.len() - 1
        }
    };
    let source = &mut sources[index];
    let mut added = Vec::new();
    for key in keys {
        let id = key.to_string();
        if source.keys.iter().any(|existing| existing.to_string() == id) {
            debug!(key = %id, "master key already present");
            continue;
        }
        source.keys.push(key);
        added.push(id);
    }
    Ok(added)
}

/// Remove every master key whose string form is listed in `keys`.
///
/// Sources left empty are dropped. Returns the string form of the keys
/// actually removed.
pub fn remove_master_keys(sources: &mut Vec<KeySource>, keys: &[String]) -> Vec<String> {
    let mut removed = Vec::new();
    let filtered: Vec<KeySource> = sources
        .drain(..)
        .filter_map(|source| {
            let mut kept = Vec::with_capacity(source.keys.len());
            for key in source.keys {
                let id = key.to_string();
                if keys.contains(&id) {
                    removed.push(id);
                } else {
                    kept.push(key);
                }
            }
            (!kept.is_empty()).then(|| KeySource::new(source.name, kept))
        })
        .collect();
    *sources = filtered;
    removed
}

/// Total number of master keys across sources.
pub fn count_master_keys(sources: &[KeySource]) -> usize {
    sources.iter().map(|s| s.keys.len()).sum()
}

/// Injected collaborators used to build and operate master keys.
///
/// Network clients are traits so that callers bring their own SDKs; PGP
/// defaults to the local `gpg` binary.
#[derive(Clone)]
pub struct KeyServices {
    kms_client: Option<Arc<dyn KmsClient>>,
    ovh_client: Option<Arc<dyn OvhKmsClient>>,
    pgp_backend: Arc<dyn PgpBackend>,
    age_identities: Option<Arc<Vec<::age::x25519::Identity>>>,
    timeout: Duration,
}

impl Default for KeyServices {
    fn default() -> Self {
        Self {
            kms_client: None,
            ovh_client: None,
            pgp_backend: Arc::new(GnuPgBackend::from_env()),
            age_identities: None,
            timeout: DEFAULT_KEY_TIMEOUT,
        }
    }
}

impl fmt::Debug for KeyServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyServices")
            .field("kms_client", &self.kms_client.is_some())
            .field("ovh_client", &self.ovh_client.is_some())
            .field(
                "age_identities",
                &self.age_identities.as_ref().map(|ids| ids.len()),
            )
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KeyServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kms_client(mut self, client: Arc<dyn KmsClient>) -> Self {
        self.kms_client = Some(client);
        self
    }

    pub fn with_ovh_kms_client(mut self, client: Arc<dyn OvhKmsClient>) -> Self {
        self.ovh_client = Some(client);
        self
    }

    pub fn with_pgp_backend(mut self, backend: Arc<dyn PgpBackend>) -> Self {
        self.pgp_backend = backend;
        self
    }

    /// Use these identities instead of reading them from the environment.
    pub fn with_age_identities(mut self, identities: Vec<::age::x25519::Identity>) -> Self {
        self.age_identities = Some(Arc::new(identities));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn kms_client(&self) -> Option<Arc<dyn KmsClient>> {
        self.kms_client.clone()
    }

    pub(crate) fn ovh_client(&self) -> Option<Arc<dyn OvhKmsClient>> {
        self.ovh_client.clone()
    }

    pub(crate) fn pgp_backend(&self) -> Arc<dyn PgpBackend> {
        self.pgp_backend.clone()
    }

    pub(crate) fn age_identities(&self) -> Option<Arc<Vec<::age::x25519::Identity>>> {
        self.age_identities.clone()
    }

    /// KMS keys from a comma separated list of ARNs (`arn[+role_arn]`).
    pub fn kms_keys(
        &self,
        arns: &str,
        context: std::collections::BTreeMap<String, String>,
        aws_profile: Option<&str>,
    ) -> Result<Vec<Box<dyn MasterKey>>> {
        split_list(arns)
            .map(|arn| {
                KmsMasterKey::from_arn(arn, context.clone(), aws_profile, self)
                    .map(|k| Box::new(k) as Box<dyn MasterKey>)
            })
            .collect()
    }

    /// PGP keys from a comma separated list of fingerprints.
    pub fn pgp_keys(&self, fingerprints: &str) -> Vec<Box<dyn MasterKey>> {
        split_list(fingerprints)
            .map(|fp| Box::new(PgpMasterKey::new(fp, self)) as Box<dyn MasterKey>)
            .collect()
    }

    /// OVH KMS keys from a comma separated list of `<endpoint>/<key id>`.
    pub fn ovh_kms_keys(&self, key_ids: &str) -> Result<Vec<Box<dyn MasterKey>>> {
        split_list(key_ids)
            .map(|id| OvhKmsMasterKey::from_key_id(id, self).map(|k| Box::new(k) as Box<dyn MasterKey>))
            .collect()
    }

    /// age keys from a comma separated list of recipients.
    pub fn age_keys(&self, recipients: &str) -> Result<Vec<Box<dyn MasterKey>>> {
        split_list(recipients)
            .map(|r| AgeMasterKey::new(r, self).map(|k| Box::new(k) as Box<dyn MasterKey>))
            .collect()
    }

    /// Rebuild a master key from its metadata entry.
    pub fn master_key_from_map(
        &self,
        source_name: &str,
        entry: &Map<String, JsonValue>,
    ) -> Result<Box<dyn MasterKey>> {
        match source_name {
            kms::KEY_TYPE => Ok(Box::new(KmsMasterKey::from_map(entry, self)?)),
            pgp::KEY_TYPE => Ok(Box::new(PgpMasterKey::from_map(entry, self)?)),
            ovh::KEY_TYPE => Ok(Box::new(OvhKmsMasterKey::from_map(entry, self)?)),
            age::KEY_TYPE => Ok(Box::new(AgeMasterKey::from_map(entry, self)?)),
            other => Err(SealError::InvalidMetadata(format!(
                "unknown key source '{other}'"
            ))),
        }
    }
}

/// Metadata source names understood by [`KeyServices::master_key_from_map`].
pub const KEY_SOURCE_NAMES: [&str; 4] = [kms::KEY_TYPE, pgp::KEY_TYPE, ovh::KEY_TYPE, age::KEY_TYPE];

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Map helpers shared by backends
// ---------------------------------------------------------------------------

pub(crate) fn required_str<'a>(entry: &'a Map<String, JsonValue>, field: &str, source: &str) -> Result<&'a str> {
    entry
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| SealError::InvalidMetadata(format!("{source} key is missing '{field}'")))
}

pub(crate) fn optional_str<'a>(entry: &'a Map<String, JsonValue>, field: &str) -> Option<&'a str> {
    entry
        .get(field)
        .and_then(JsonValue::as_str)
        .filter(|s| !s.is_empty())
}

pub(crate) fn parse_created_at(entry: &Map<String, JsonValue>, source: &str) -> Result<DateTime<Utc>> {
    let raw = required_str(entry, "created_at", source)?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SealError::InvalidMetadata(format!("{source} key has invalid created_at '{raw}': {e}")))
}

pub(crate) fn format_created_at(timestamp: &DateTime<Utc>) -> JsonValue {
    JsonValue::String(timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
}

pub(crate) fn older_than_ttl(created_at: &DateTime<Utc>) -> bool {
    exceeds_ttl(created_at, &Utc::now())
}

fn exceeds_ttl(created_at: &DateTime<Utc>, now: &DateTime<Utc>) -> bool {
    now.signed_duration_since(*created_at) > chrono::Duration::days(ROTATION_TTL_DAYS)
}

/// Attribute a client error to `key` as a wrap failure, unless the client
/// already reported one.
pub(crate) fn encryption_error(key: &str, err: SealError) -> SealError {
    match err {
        SealError::KeyEncryption { .. } => err,
        other => SealError::KeyEncryption {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Attribute a client error to `key` as an unwrap failure, unless the client
/// already reported one.
pub(crate) fn decryption_error(key: &str, err: SealError) -> SealError {
    match err {
        SealError::KeyDecryption { .. } => err,
        other => SealError::KeyDecryption {
            key: key.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Current time truncated to whole seconds, the precision metadata keeps.
pub(crate) fn now_seconds() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now)
}
