//! Configuration for sealing documents.
//!
//! Settings are loaded from a JSON file. Creation rules pick the master keys
//! for a new document from its path: the first rule whose `path_regex`
//! matches wins, and a rule without `path_regex` matches every path.
//!
//! ```json
//! {
//!   "ignore_mac": false,
//!   "key_timeout_secs": 10,
//!   "creation_rules": [
//!     { "path_regex": "prod/.*\\.json$", "kms": "arn:aws:kms:us-east-1:1:key/abc" },
//!     { "age": "age1..." }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SealError};
use crate::keysource::{self, KeyServices, KeySource};
use crate::scope::EncryptionScope;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_regex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_regex: Option<String>,

    /// Accept documents whose MAC does not verify. Mismatches are still
    /// logged and audited.
    #[serde(default)]
    pub ignore_mac: bool,

    /// Deadline for each key service call, in seconds.
    #[serde(default = "default_key_timeout_secs")]
    pub key_timeout_secs: u64,

    #[serde(default)]
    pub creation_rules: Vec<CreationRule>,
}

fn default_key_timeout_secs() -> u64 {
    keysource::DEFAULT_KEY_TIMEOUT.as_secs()
}

impl Default for SealConfig {
    fn default() -> Self {
        Self {
            unencrypted_suffix: None,
            encrypted_suffix: None,
            unencrypted_regex: None,
            encrypted_regex: None,
            ignore_mac: false,
            key_timeout_secs: default_key_timeout_secs(),
            creation_rules: Vec::new(),
        }
    }
}

/// Keys and scope for documents whose path matches `path_regex`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_regex: Option<String>,

    /// Comma separated KMS ARNs, optionally `arn+role_arn`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kms_context: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_profile: Option<String>,

    /// Comma separated PGP fingerprints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp: Option<String>,

    /// Comma separated age recipients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,

    /// Comma separated `<endpoint>/<key id>` pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovh_kms: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_suffix: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unencrypted_regex: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_regex: Option<String>,
}

impl SealConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading configuration");
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SealError::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check scope settings and regexes up front.
    pub fn validate(&self) -> Result<()> {
        self.scope()?;
        for rule in &self.creation_rules {
            rule.path_matcher()?;
            rule.scope_override()?;
        }
        Ok(())
    }

    /// The configured scope rule, or the default.
    pub fn scope(&self) -> Result<EncryptionScope> {
        EncryptionScope::from_fields(
            self.unencrypted_suffix.as_deref(),
            self.encrypted_suffix.as_deref(),
            self.unencrypted_regex.as_deref(),
            self.encrypted_regex.as_deref(),
        )
    }

    pub fn key_timeout(&self) -> Duration {
        Duration::from_secs(self.key_timeout_secs)
    }

    /// First creation rule matching `path`.
    pub fn rule_for_path(&self, path: &str) -> Result<Option<&CreationRule>> {
        for rule in &self.creation_rules {
            match rule.path_matcher()? {
                Some(re) if !re.is_match(path) => continue,
                _ => return Ok(Some(rule)),
            }
        }
        Ok(None)
    }

    /// Key sources and scope for a new document at `path`.
    pub fn creation_settings(
        &self,
        path: &str,
        services: &KeyServices,
    ) -> Result<(Vec<KeySource>, EncryptionScope)> {
        let rule = self
            .rule_for_path(path)?
            .ok_or_else(|| SealError::Config(format!("no creation rule matches '{path}'")))?;
        let scope = match rule.scope_override()? {
            Some(scope) => scope,
            None => self.scope()?,
        };
        Ok((rule.key_sources(services)?, scope))
    }

    pub fn with_unencrypted_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.unencrypted_suffix = Some(suffix.into());
        self
    }

    pub fn with_encrypted_regex(mut self, pattern: impl Into<String>) -> Self {
        self.encrypted_regex = Some(pattern.into());
        self
    }

    pub fn with_ignore_mac(mut self, ignore: bool) -> Self {
        self.ignore_mac = ignore;
        self
    }

    pub fn with_key_timeout_secs(mut self, secs: u64) -> Self {
        self.key_timeout_secs = secs;
        self
    }

    pub fn with_creation_rule(mut self, rule: CreationRule) -> Self {
        self.creation_rules.push(rule);
        self
    }
}

impl CreationRule {
    fn path_matcher(&self) -> Result<Option<Regex>> {
        self.path_regex
            .as_deref()
            .map(|p| {
                Regex::new(p).map_err(|e| SealError::Config(format!("invalid path_regex '{p}': {e}")))
            })
            .transpose()
    }

    fn scope_override(&self) -> Result<Option<EncryptionScope>> {
        let set = self.unencrypted_suffix.is_some()
            || self.encrypted_suffix.is_some()
            || self.unencrypted_regex.is_some()
            || self.encrypted_regex.is_some();
        if !set {
            return Ok(None);
        }
        EncryptionScope::from_fields(
            self.unencrypted_suffix.as_deref(),
            self.encrypted_suffix.as_deref(),
            self.unencrypted_regex.as_deref(),
            self.encrypted_regex.as_deref(),
        )
        .map(Some)
    }

    /// Build the master keys this rule names, grouped by backend.
    pub fn key_sources(&self, services: &KeyServices) -> Result<Vec<KeySource>> {
        let mut sources = Vec::new();
        if let Some(arns) = &self.kms {
            let keys = services.kms_keys(arns, self.kms_context.clone(), self.aws_profile.as_deref())?;
            push_source(&mut sources, keysource::kms::KEY_TYPE, keys);
        }
        if let Some(fps) = &self.pgp {
            push_source(&mut sources, keysource::pgp::KEY_TYPE, services.pgp_keys(fps));
        }
        if let Some(ids) = &self.ovh_kms {
            push_source(&mut sources, keysource::ovh::KEY_TYPE, services.ovh_kms_keys(ids)?);
        }
        if let Some(recipients) = &self.age {
            push_source(&mut sources, keysource::age::KEY_TYPE, services.age_keys(recipients)?);
        }
        if sources.is_empty() {
            return Err(SealError::Config("creation rule names no master keys".into()));
        }
        Ok(sources)
    }
}

fn push_source(
    sources: &mut Vec<KeySource>,
    name: &str,
    keys: Vec<Box<dyn keysource::MasterKey>>,
) {
    if !keys.is_empty() {
        sources.push(KeySource::new(name, keys));
    }
}
