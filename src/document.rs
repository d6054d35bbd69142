//! Document operations.
//!
//! A [`Document`] is a value tree plus its metadata. The tree is either fully
//! plaintext (after [`Document::decrypt`]) or carries envelopes for every
//! in-scope value (after [`Document::encrypt`] or when freshly loaded).
//!
//! The data key exists only inside a single operation. Operations that touch
//! more than one part of the document run on a copy that is committed only
//! once every step has succeeded.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::cipher;
use crate::config::SealConfig;
use crate::error::{Result, SealError};
use crate::keys::DataKey;
use crate::keysource::{self, KeyServices, KeySource, MasterKey};
use crate::mac::{self, MacAccumulator};
use crate::metadata::Metadata;
use crate::scope::EncryptionScope;
use crate::store::{Format, Store};
use crate::tree::{PathSegment, Scalar, TreeBranch};

/// Per-operation switches.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Accept a MAC mismatch on decrypt, with a warning and an audit record.
    pub ignore_mac: bool,
    /// Scope rule for documents created by [`encrypt`].
    pub scope: EncryptionScope,
}

impl Options {
    pub fn from_config(config: &SealConfig) -> Result<Self> {
        Ok(Self {
            ignore_mac: config.ignore_mac,
            scope: config.scope()?,
        })
    }
}

/// Result of a tree pass: the plaintext MAC and how many values changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    pub mac: String,
    pub values: usize,
}

/// Master keys that changed in an [`Document::update_keys`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// `a:b:` for the path `["a", "b"]`.
fn additional_data(path: &[String]) -> String {
    let mut aad = path.join(":");
    aad.push(':');
    aad
}

/// Encrypt every in-scope scalar of `branch` in place.
pub fn encrypt_tree(branch: &mut TreeBranch, key: &DataKey, scope: &EncryptionScope) -> Result<TreeDigest> {
    let mut accumulator = MacAccumulator::new();
    let mut values = 0;
    branch.walk_leaves(|scalar, path| {
        if scalar.is_null() {
            return Ok(());
        }
        accumulator.update(scalar);
        if scope.should_encrypt(path) {
            let envelope = cipher::encrypt(scalar, key, &additional_data(path))?;
            *scalar = Scalar::String(envelope);
            values += 1;
        }
        Ok(())
    })?;
    Ok(TreeDigest {
        mac: accumulator.finish(),
        values,
    })
}

/// Decrypt every in-scope envelope of `branch` in place.
///
/// In-scope strings that are not envelopes are left as they are.
pub fn decrypt_tree(branch: &mut TreeBranch, key: &DataKey, scope: &EncryptionScope) -> Result<TreeDigest> {
    let mut accumulator = MacAccumulator::new();
    let mut values = 0;
    branch.walk_leaves(|scalar, path| {
        if scalar.is_null() {
            return Ok(());
        }
        if scope.should_encrypt(path) {
            if let Scalar::String(text) = scalar {
                if cipher::is_envelope(text) {
                    *scalar = cipher::decrypt(text, key, &additional_data(path))?;
                    values += 1;
                }
            }
        }
        accumulator.update(scalar);
        Ok(())
    })?;
    Ok(TreeDigest {
        mac: accumulator.finish(),
        values,
    })
}

#[derive(Debug, Clone)]
pub struct Document {
    pub branch: TreeBranch,
    pub metadata: Metadata,
}

impl Document {
    pub fn new(branch: TreeBranch, metadata: Metadata) -> Self {
        Self { branch, metadata }
    }

    /// A plaintext document with the keys and scope the creation rules pick
    /// for `path`.
    pub fn for_path(
        branch: TreeBranch,
        path: &str,
        config: &SealConfig,
        services: &KeyServices,
    ) -> Result<Self> {
        let (sources, scope) = config.creation_settings(path, services)?;
        Ok(Self::new(branch, Metadata::new(sources, scope)))
    }

    /// Parse an encrypted document.
    pub fn parse(bytes: &[u8], store: &dyn Store, services: &KeyServices) -> Result<Self> {
        let metadata = store.unmarshal_metadata(bytes, services)?;
        let branch = store.unmarshal(bytes)?;
        Ok(Self { branch, metadata })
    }

    /// Read and parse an encrypted document, picking the store from the
    /// file name.
    pub fn load(path: impl AsRef<Path>, services: &KeyServices) -> Result<Self> {
        let path = path.as_ref();
        let store = Format::from_path(path)?.store();
        let bytes = std::fs::read(path)?;
        debug!(path = %path.display(), "loading document");
        Self::parse(&bytes, store.as_ref(), services)
    }

    pub fn to_bytes(&self, store: &dyn Store) -> Result<Vec<u8>> {
        store.marshal_with_metadata(&self.branch, &self.metadata)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let store = Format::from_path(path)?.store();
        let bytes = self.to_bytes(store.as_ref())?;
        std::fs::write(path, bytes)?;
        debug!(path = %path.display(), "saved document");
        Ok(())
    }

    /// Serialize the value at `path` on its own.
    pub fn extract(&self, path: &[PathSegment], store: &dyn Store) -> Result<Vec<u8>> {
        store.marshal_value(self.branch.get(path)?)
    }

    /// Recover the data key from the first master key that works.
    pub fn data_key(&self, audit: &mut AuditLog) -> Result<DataKey> {
        keysource::get_data_key(&self.metadata.key_sources, audit)
    }

    /// Decrypt the tree in place and check the MAC.
    ///
    /// Returns the data key so the caller can re-encrypt after editing.
    pub fn decrypt(&mut self, options: &Options, audit: &mut AuditLog) -> Result<DataKey> {
        let data_key = self.data_key(audit)?;
        let mut branch = self.branch.clone();
        let digest = decrypt_tree(&mut branch, &data_key, &self.metadata.scope)?;

        match self.verify_mac(&data_key, &digest.mac) {
            Ok(()) => {}
            Err(err @ (SealError::MacMismatch { .. } | SealError::AuthenticationFailure { .. }))
                if options.ignore_mac =>
            {
                warn!(error = %err, "MAC verification failed; continuing because ignore_mac is set");
                audit.record(AuditEvent::MacMismatchIgnored);
            }
            Err(err) => return Err(err),
        }

        self.branch = branch;
        info!(values = digest.values, "document decrypted");
        audit.record(AuditEvent::DocumentDecrypted {
            decrypted_values: digest.values,
        });
        Ok(data_key)
    }

    fn verify_mac(&self, data_key: &DataKey, computed: &str) -> Result<()> {
        let stored = mac::decrypt_mac(
            &self.metadata.message_authentication_code,
            data_key,
            &self.metadata.last_modified,
        )?;
        mac::verify(&stored, computed)
    }

    /// Encrypt a plaintext tree with `data_key`.
    ///
    /// Master keys without a wrapped copy wrap the key first; if any of them
    /// fails, the document is left untouched.
    pub fn encrypt(&mut self, data_key: &DataKey, audit: &mut AuditLog) -> Result<()> {
        let mut work = self.clone();
        if keysource::count_master_keys(&work.metadata.key_sources) == 0 {
            return Err(SealError::Config("document has no master keys".into()));
        }
        keysource::update_master_keys_if_needed(&mut work.metadata.key_sources, data_key, audit)?;
        let values = work.seal_values(data_key)?;
        *self = work;
        info!(values, "document encrypted");
        audit.record(AuditEvent::DocumentEncrypted {
            encrypted_values: values,
        });
        Ok(())
    }

    /// Stamp, encrypt values and store the encrypted MAC.
    fn seal_values(&mut self, data_key: &DataKey) -> Result<usize> {
        self.metadata.touch();
        let digest = encrypt_tree(&mut self.branch, data_key, &self.metadata.scope)?;
        self.metadata.message_authentication_code =
            mac::encrypt_mac(&digest.mac, data_key, &self.metadata.last_modified)?;
        Ok(digest.values)
    }

    /// Replace the data key of an encrypted document.
    ///
    /// Every value, the MAC and every wrapped copy change; the plaintext does
    /// not. All master keys must wrap the new key or nothing is changed.
    pub fn rotate(&mut self, options: &Options, audit: &mut AuditLog) -> Result<()> {
        let mut work = self.clone();
        work.decrypt(options, audit)?;

        let new_key = DataKey::generate()?;
        keysource::clear_wrapped_keys(&mut work.metadata.key_sources);
        keysource::update_master_keys(&mut work.metadata.key_sources, &new_key, audit)?;
        work.seal_values(&new_key)?;

        let master_keys = keysource::count_master_keys(&work.metadata.key_sources);
        *self = work;
        info!(master_keys, "data key rotated");
        audit.record(AuditEvent::DocumentRotated { master_keys });
        Ok(())
    }

    /// Add master keys to the source `source_name` and wrap the current data
    /// key with them. Existing wrapped copies are not touched.
    pub fn add_master_keys(
        &mut self,
        source_name: &str,
        keys: Vec<Box<dyn MasterKey>>,
        audit: &mut AuditLog,
    ) -> Result<Vec<String>> {
        let data_key = self.data_key(audit)?;
        let mut sources = self.metadata.key_sources.clone();
        let added = keysource::add_master_keys(&mut sources, source_name, keys)?;
        keysource::update_master_keys_if_needed(&mut sources, &data_key, audit)?;
        self.metadata.key_sources = sources;
        if !added.is_empty() {
            info!(source = source_name, count = added.len(), "master keys added");
            audit.record(AuditEvent::MasterKeysAdded {
                source: source_name.to_string(),
                keys: added.clone(),
            });
        }
        Ok(added)
    }

    /// Remove master keys by their string form.
    ///
    /// The data key is not rotated; holders of a removed key may still know
    /// it until [`Document::rotate`] runs. Removing every key is refused.
    pub fn remove_master_keys(&mut self, keys: &[String], audit: &mut AuditLog) -> Result<Vec<String>> {
        let mut sources = self.metadata.key_sources.clone();
        let removed = keysource::remove_master_keys(&mut sources, keys);
        if keysource::count_master_keys(&sources) == 0 {
            return Err(SealError::Config("refusing to remove every master key".into()));
        }
        self.metadata.key_sources = sources;
        if !removed.is_empty() {
            info!(count = removed.len(), "master keys removed");
            audit.record(AuditEvent::MasterKeysRemoved {
                keys: removed.clone(),
            });
        }
        Ok(removed)
    }

    /// Replace the master key list with `sources`.
    ///
    /// Keys present before and after keep their wrapped copy. New keys wrap
    /// the current data key.
    pub fn update_keys(&mut self, mut sources: Vec<KeySource>, audit: &mut AuditLog) -> Result<KeyChanges> {
        if keysource::count_master_keys(&sources) == 0 {
            return Err(SealError::Config("no master keys given".into()));
        }
        let existing: Vec<&Box<dyn MasterKey>> = self.metadata.master_keys().collect();
        let mut changes = KeyChanges::default();
        for source in sources.iter_mut() {
            for key in source.keys.iter_mut() {
                let found = existing.iter().find(|old| {
                    old.type_identifier() == key.type_identifier() && old.to_string() == key.to_string()
                });
                match found {
                    Some(old) => *key = (*old).clone(),
                    None => changes.added.push(key.to_string()),
                }
            }
        }
        for old in &existing {
            let kept = sources.iter().flat_map(|s| s.keys.iter()).any(|key| {
                old.type_identifier() == key.type_identifier() && old.to_string() == key.to_string()
            });
            if !kept {
                changes.removed.push(old.to_string());
            }
        }

        if !changes.added.is_empty() {
            let data_key = self.data_key(audit)?;
            keysource::update_master_keys_if_needed(&mut sources, &data_key, audit)?;
        }
        self.metadata.key_sources = sources;

        for source in &self.metadata.key_sources {
            let added: Vec<String> = source
                .keys
                .iter()
                .map(|k| k.to_string())
                .filter(|k| changes.added.contains(k))
                .collect();
            if !added.is_empty() {
                audit.record(AuditEvent::MasterKeysAdded {
                    source: source.name.clone(),
                    keys: added,
                });
            }
        }
        if !changes.removed.is_empty() {
            audit.record(AuditEvent::MasterKeysRemoved {
                keys: changes.removed.clone(),
            });
        }
        info!(added = changes.added.len(), removed = changes.removed.len(), "master keys updated");
        Ok(changes)
    }
}

/// Encrypt a plaintext tree under a fresh data key wrapped by `key_sources`.
///
/// Copies already held by the keys belong to another data key and are
/// replaced.
pub fn encrypt(
    branch: TreeBranch,
    mut key_sources: Vec<KeySource>,
    options: &Options,
    audit: &mut AuditLog,
) -> Result<(TreeBranch, Metadata)> {
    keysource::clear_wrapped_keys(&mut key_sources);
    let data_key = DataKey::generate()?;
    let mut document = Document::new(branch, Metadata::new(key_sources, options.scope.clone()));
    document.encrypt(&data_key, audit)?;
    Ok((document.branch, document.metadata))
}

/// Parse and decrypt a document, returning the plaintext tree.
pub fn decrypt(
    bytes: &[u8],
    store: &dyn Store,
    services: &KeyServices,
    options: &Options,
    audit: &mut AuditLog,
) -> Result<TreeBranch> {
    let mut document = Document::parse(bytes, store, services)?;
    document.decrypt(options, audit)?;
    Ok(document.branch)
}

/// Rotate the data key of an encrypted document.
pub fn rotate(
    metadata: Metadata,
    branch: TreeBranch,
    options: &Options,
    audit: &mut AuditLog,
) -> Result<(Metadata, TreeBranch)> {
    let mut document = Document::new(branch, metadata);
    document.rotate(options, audit)?;
    Ok((document.metadata, document.branch))
}
