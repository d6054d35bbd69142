//! Which values get encrypted.
//!
//! A document carries exactly one scope rule. A leaf is judged by every key
//! on its path: if any segment matches the rule, that decides the leaf.

use regex::Regex;

use crate::error::{Result, SealError};

/// Default suffix marking keys that stay in plaintext.
pub const DEFAULT_UNENCRYPTED_SUFFIX: &str = "unencrypted_";

#[derive(Debug, Clone)]
pub enum EncryptionScope {
    /// Keys ending with the suffix (and everything below them) stay plaintext.
    UnencryptedSuffix(String),
    /// Only keys ending with the suffix (and everything below them) are encrypted.
    EncryptedSuffix(String),
    UnencryptedRegex(Regex),
    EncryptedRegex(Regex),
}

impl Default for EncryptionScope {
    fn default() -> Self {
        EncryptionScope::UnencryptedSuffix(DEFAULT_UNENCRYPTED_SUFFIX.to_string())
    }
}

impl PartialEq for EncryptionScope {
    fn eq(&self, other: &Self) -> bool {
        self.metadata_key() == other.metadata_key() && self.pattern() == other.pattern()
    }
}

impl EncryptionScope {
    /// Build the rule from the four optional settings.
    ///
    /// Setting more than one is an error. Setting none yields the default.
    pub fn from_fields(
        unencrypted_suffix: Option<&str>,
        encrypted_suffix: Option<&str>,
        unencrypted_regex: Option<&str>,
        encrypted_regex: Option<&str>,
    ) -> Result<Self> {
        let set = [
            unencrypted_suffix.is_some(),
            encrypted_suffix.is_some(),
            unencrypted_regex.is_some(),
            encrypted_regex.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if set > 1 {
            return Err(SealError::Config(
                "only one of unencrypted_suffix, encrypted_suffix, unencrypted_regex \
                 or encrypted_regex may be set"
                    .into(),
            ));
        }

        if let Some(suffix) = unencrypted_suffix {
            return Ok(EncryptionScope::UnencryptedSuffix(suffix.to_string()));
        }
        if let Some(suffix) = encrypted_suffix {
            return Ok(EncryptionScope::EncryptedSuffix(suffix.to_string()));
        }
        if let Some(pattern) = unencrypted_regex {
            return Ok(EncryptionScope::UnencryptedRegex(compile(pattern)?));
        }
        if let Some(pattern) = encrypted_regex {
            return Ok(EncryptionScope::EncryptedRegex(compile(pattern)?));
        }
        Ok(EncryptionScope::default())
    }

    /// Decide whether the leaf at `path` is encrypted.
    pub fn should_encrypt(&self, path: &[String]) -> bool {
        match self {
            EncryptionScope::UnencryptedSuffix(suffix) => {
                !path.iter().any(|key| key.ends_with(suffix.as_str()))
            }
            EncryptionScope::EncryptedSuffix(suffix) => {
                path.iter().any(|key| key.ends_with(suffix.as_str()))
            }
            EncryptionScope::UnencryptedRegex(re) => !path.iter().any(|key| re.is_match(key)),
            EncryptionScope::EncryptedRegex(re) => path.iter().any(|key| re.is_match(key)),
        }
    }

    /// Name of the metadata field that records this rule.
    pub fn metadata_key(&self) -> &'static str {
        match self {
            EncryptionScope::UnencryptedSuffix(_) => "unencrypted_suffix",
            EncryptionScope::EncryptedSuffix(_) => "encrypted_suffix",
            EncryptionScope::UnencryptedRegex(_) => "unencrypted_regex",
            EncryptionScope::EncryptedRegex(_) => "encrypted_regex",
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            EncryptionScope::UnencryptedSuffix(s) | EncryptionScope::EncryptedSuffix(s) => s,
            EncryptionScope::UnencryptedRegex(re) | EncryptionScope::EncryptedRegex(re) => {
                re.as_str()
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| SealError::Config(format!("invalid regex '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_default_suffix() {
        let scope = EncryptionScope::default();
        assert!(scope.should_encrypt(&path(&["foo"])));
        assert!(!scope.should_encrypt(&path(&["baz_unencrypted_"])));
        assert!(!scope.should_encrypt(&path(&["baz_unencrypted_", "nested"])));
    }

    #[test]
    fn test_encrypted_regex_matches_any_segment() {
        let scope = EncryptionScope::from_fields(None, None, None, Some("^(data|stringData)$")).unwrap();
        assert!(scope.should_encrypt(&path(&["data", "password"])));
        assert!(!scope.should_encrypt(&path(&["metadata", "name"])));
    }

    #[test]
    fn test_encrypted_suffix() {
        let scope = EncryptionScope::from_fields(None, Some("_secret"), None, None).unwrap();
        assert!(scope.should_encrypt(&path(&["db_secret"])));
        assert!(!scope.should_encrypt(&path(&["db_host"])));
    }

    #[test]
    fn test_conflicting_rules_rejected() {
        let result = EncryptionScope::from_fields(Some("_u"), None, Some("x"), None);
        assert!(matches!(result, Err(SealError::Config(_))));
    }

    #[test]
    fn test_bad_regex_rejected() {
        assert!(EncryptionScope::from_fields(None, None, Some("("), None).is_err());
    }
}
