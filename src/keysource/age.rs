//! age master keys.
//!
//! The data key is encrypted to an X25519 recipient and stored ASCII armored.
//! Decryption uses identities injected through [`KeyServices`], or else the
//! ones found in the environment:
//!
//! 1. `SOPS_AGE_KEY`: identities inline
//! 2. `SOPS_AGE_KEY_FILE`: path to an identities file
//! 3. `$XDG_CONFIG_HOME/sops/age/keys.txt`, falling back to `~/.config`
//!
//! age keys never need rotation.

use std::fmt;
use std::io::{Read, Write};
use std::iter;
use std::path::PathBuf;
use std::sync::Arc;

use age::armor::{ArmoredReader, ArmoredWriter, Format};
use age::x25519;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use super::{required_str, KeyServices, MasterKey};
use crate::error::{Result, SealError};
use crate::keys::DataKey;

pub const KEY_TYPE: &str = "age";

pub const AGE_KEY_ENV: &str = "SOPS_AGE_KEY";
pub const AGE_KEY_FILE_ENV: &str = "SOPS_AGE_KEY_FILE";
const USER_CONFIG_PATH: &str = "sops/age/keys.txt";

/// Upper bound on a decrypted payload. A data key is 32 bytes.
const MAX_DECRYPTED_SIZE: usize = 1024;

#[derive(Clone)]
pub struct AgeMasterKey {
    pub recipient: String,
    pub encrypted_key: String,
    parsed_recipient: x25519::Recipient,
    identities: Option<Arc<Vec<x25519::Identity>>>,
}

impl fmt::Debug for AgeMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgeMasterKey")
            .field("recipient", &self.recipient)
            .field("wrapped", &!self.encrypted_key.is_empty())
            .finish()
    }
}

impl fmt::Display for AgeMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.recipient)
    }
}

impl AgeMasterKey {
    pub fn new(recipient: &str, services: &KeyServices) -> Result<Self> {
        let recipient = recipient.trim();
        let parsed_recipient = recipient.parse::<x25519::Recipient>().map_err(|e| {
            SealError::InvalidMasterKey(format!("invalid age recipient '{recipient}': {e}"))
        })?;
        Ok(Self {
            recipient: recipient.to_string(),
            encrypted_key: String::new(),
            parsed_recipient,
            identities: services.age_identities(),
        })
    }

    pub(crate) fn from_map(entry: &Map<String, JsonValue>, services: &KeyServices) -> Result<Self> {
        let mut key = Self::new(required_str(entry, "recipient", KEY_TYPE)?, services)?;
        key.encrypted_key = required_str(entry, "enc", KEY_TYPE)?.to_string();
        Ok(key)
    }

    fn identities(&self) -> Result<Arc<Vec<x25519::Identity>>> {
        match &self.identities {
            Some(ids) => Ok(ids.clone()),
            None => load_identities_from_env().map(Arc::new),
        }
    }
}

impl MasterKey for AgeMasterKey {
    fn encrypt(&mut self, data_key: &DataKey) -> Result<()> {
        let fail = |reason: String| SealError::KeyEncryption {
            key: self.recipient.clone(),
            reason,
        };
        let encryptor =
            age::Encryptor::with_recipients(iter::once(&self.parsed_recipient as &dyn age::Recipient))
                .map_err(|e| fail(format!("failed to create age encryptor: {e}")))?;

        let mut output = Vec::new();
        let armor = ArmoredWriter::wrap_output(&mut output, Format::AsciiArmor)
            .map_err(|e| fail(format!("failed to create armored writer: {e}")))?;
        let mut writer = encryptor
            .wrap_output(armor)
            .map_err(|e| fail(format!("failed to create age writer: {e}")))?;
        writer
            .write_all(data_key.as_bytes())
            .map_err(|e| fail(format!("failed to encrypt data key with age: {e}")))?;
        writer
            .finish()
            .and_then(|armor| armor.finish())
            .map_err(|e| fail(format!("failed to close age writer: {e}")))?;

        let armored = String::from_utf8(output)
            .map_err(|e| fail(format!("armored output is not UTF-8: {e}")))?;
        self.encrypted_key = armored;
        info!(recipient = %self.recipient, "encryption succeeded");
        Ok(())
    }

    fn decrypt(&self) -> Result<DataKey> {
        let fail = |reason: String| SealError::KeyDecryption {
            key: self.recipient.clone(),
            reason,
        };
        let identities = self
            .identities()
            .map_err(|e| fail(format!("failed to load age identities: {e}")))?;

        let decryptor = age::Decryptor::new_buffered(ArmoredReader::new(self.encrypted_key.as_bytes()))
            .map_err(|e| fail(format!("failed to parse age ciphertext: {e}")))?;
        if decryptor.is_scrypt() {
            return Err(fail("passphrase-encrypted data keys are not supported".into()));
        }
        let mut reader = decryptor
            .decrypt(identities.iter().map(|i| i as &dyn age::Identity))
            .map_err(|e| fail(format!("failed to decrypt: {e}")))?;

        let mut plaintext = Vec::new();
        let mut buffer = [0u8; 256];
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|e| fail(format!("failed to read decrypted data: {e}")))?;
            if read == 0 {
                break;
            }
            if plaintext.len() + read > MAX_DECRYPTED_SIZE {
                return Err(fail(format!(
                    "decrypted data exceeds {MAX_DECRYPTED_SIZE} bytes"
                )));
            }
            plaintext.extend_from_slice(&buffer[..read]);
        }
        info!(recipient = %self.recipient, "decryption succeeded");
        DataKey::from_slice(&plaintext)
    }

    fn needs_rotation(&self) -> bool {
        false
    }

    fn to_map(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        out.insert("recipient".into(), JsonValue::String(self.recipient.clone()));
        out.insert("enc".into(), JsonValue::String(self.encrypted_key.clone()));
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

/// Parse identities, one per line. Blank lines and `#` comments are skipped.
pub fn parse_identities(contents: &str) -> Result<Vec<x25519::Identity>> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.parse::<x25519::Identity>()
                .map_err(|e| SealError::InvalidMasterKey(format!("invalid age identity: {e}")))
        })
        .collect()
}

fn user_config_keys_file() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .filter(|dir| !dir.is_empty())
                .map(|home| PathBuf::from(home).join(".config"))
        })?;
    Some(base.join(USER_CONFIG_PATH))
}

/// Collect identities from every configured environment location.
pub fn load_identities_from_env() -> Result<Vec<x25519::Identity>> {
    let mut identities = Vec::new();
    let mut found_source = false;

    if let Ok(inline) = std::env::var(AGE_KEY_ENV) {
        found_source = true;
        identities.extend(parse_identities(&inline)?);
    }

    if let Some(path) = std::env::var_os(AGE_KEY_FILE_ENV) {
        found_source = true;
        let contents = std::fs::read_to_string(&path)?;
        identities.extend(parse_identities(&contents)?);
    }

    if let Some(path) = user_config_keys_file() {
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                debug!(path = %path.display(), "loading age identities");
                identities.extend(parse_identities(&contents)?);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && found_source => {}
            Err(e) => return Err(e.into()),
        }
    } else if !found_source {
        return Err(SealError::InvalidMasterKey(
            "no age identities configured".into(),
        ));
    }

    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use age::secrecy::ExposeSecret;

    fn identity_pair() -> (x25519::Identity, String) {
        let identity = x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        (identity, recipient)
    }

    #[test]
    fn test_wrap_and_unwrap() {
        let (identity, recipient) = identity_pair();
        let services = KeyServices::new().with_age_identities(vec![identity]);
        let mut key = AgeMasterKey::new(&recipient, &services).unwrap();
        let data_key = DataKey::from_bytes([0x42; 32]);
        key.encrypt(&data_key).unwrap();
        assert!(key.encrypted_key.starts_with("-----BEGIN AGE ENCRYPTED FILE-----"));
        assert_eq!(key.decrypt().unwrap().as_bytes(), data_key.as_bytes());
    }

    #[test]
    fn test_wrong_identity_fails() {
        let (_, recipient) = identity_pair();
        let (other, _) = identity_pair();
        let services = KeyServices::new().with_age_identities(vec![other]);
        let mut key = AgeMasterKey::new(&recipient, &services).unwrap();
        key.encrypt(&DataKey::from_bytes([1; 32])).unwrap();
        assert!(matches!(key.decrypt(), Err(SealError::KeyDecryption { .. })));
    }

    #[test]
    fn test_invalid_recipient() {
        assert!(AgeMasterKey::new("age1notvalid", &KeyServices::new()).is_err());
    }

    #[test]
    fn test_parse_identities_skips_comments() {
        let (identity, _) = identity_pair();
        let contents = format!(
            "# created: 2024-01-01\n\n{}\n",
            identity.to_string().expose_secret()
        );
        assert_eq!(parse_identities(&contents).unwrap().len(), 1);
        assert!(parse_identities("garbage").is_err());
    }

    #[test]
    fn test_never_needs_rotation() {
        let (_, recipient) = identity_pair();
        let key = AgeMasterKey::new(&recipient, &KeyServices::new()).unwrap();
        assert!(!key.needs_rotation());
    }
}
