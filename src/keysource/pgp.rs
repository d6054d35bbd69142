//! PGP master keys.
//!
//! Wrapping goes through a [`PgpBackend`]. The default backend drives the
//! local `gpg` binary; `SOPS_GPG_EXEC` overrides the binary and `GNUPGHOME`
//! selects the keyring.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info};

use super::{
    decryption_error, encryption_error, format_created_at, now_seconds, older_than_ttl, parse_created_at,
    required_str, KeyServices, MasterKey,
};
use crate::error::{Result, SealError};
use crate::keys::DataKey;

pub const KEY_TYPE: &str = "pgp";

/// Environment variable naming an alternative gpg binary.
pub const GPG_EXEC_ENV: &str = "SOPS_GPG_EXEC";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Something that can encrypt to and decrypt with PGP keys.
pub trait PgpBackend: Send + Sync {
    /// Encrypt `plaintext` to `fingerprint`, returning ASCII-armored output.
    fn encrypt(&self, fingerprint: &str, plaintext: &[u8], timeout: Duration) -> Result<String>;

    /// Decrypt an ASCII-armored message.
    fn decrypt(&self, armored: &str, timeout: Duration) -> Result<Vec<u8>>;
}

/// [`PgpBackend`] running the GnuPG command line tool.
#[derive(Debug, Clone)]
pub struct GnuPgBackend {
    binary: String,
    home_dir: Option<PathBuf>,
}

impl GnuPgBackend {
    pub fn from_env() -> Self {
        let binary = std::env::var(GPG_EXEC_ENV)
            .ok()
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "gpg".to_string());
        let home_dir = std::env::var_os("GNUPGHOME")
            .filter(|h| !h.is_empty())
            .map(PathBuf::from);
        Self { binary, home_dir }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }

    fn run(&self, args: &[&str], stdin: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let mut command = Command::new(&self.binary);
        if let Some(home) = &self.home_dir {
            command.arg("--homedir").arg(home);
        }
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!(binary = %self.binary, ?args, "running gpg");

        let mut child = command.spawn()?;
        if let Some(mut input) = child.stdin.take() {
            if let Err(err) = input.write_all(stdin) {
                reap(&mut child);
                return Err(err.into());
            }
        }
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_deadline(&mut child, timeout)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if status.success() {
            Ok(stdout)
        } else {
            Err(SealError::Io(std::io::Error::other(
                String::from_utf8_lossy(&stderr).trim().to_string(),
            )))
        }
    }
}

impl Default for GnuPgBackend {
    fn default() -> Self {
        Self::from_env()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            reap(child);
            return Err(SealError::Timeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Last 16 characters of a fingerprint, accepted by older GnuPG releases.
fn short_fingerprint(fingerprint: &str) -> &str {
    let offset = fingerprint.len().saturating_sub(16);
    fingerprint.get(offset..).unwrap_or(fingerprint)
}

impl PgpBackend for GnuPgBackend {
    fn encrypt(&self, fingerprint: &str, plaintext: &[u8], timeout: Duration) -> Result<String> {
        let args = [
            "--no-default-recipient",
            "--yes",
            "--encrypt",
            "-a",
            "-r",
            fingerprint,
            "--trusted-key",
            short_fingerprint(fingerprint),
            "--no-encrypt-to",
        ];
        let out = self.run(&args, plaintext, timeout)?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    fn decrypt(&self, armored: &str, timeout: Duration) -> Result<Vec<u8>> {
        self.run(&["-d"], armored.as_bytes(), timeout)
    }
}

#[derive(Clone)]
pub struct PgpMasterKey {
    pub fingerprint: String,
    pub encrypted_key: String,
    pub creation_date: DateTime<Utc>,
    backend: Arc<dyn PgpBackend>,
    timeout: Duration,
}

impl fmt::Debug for PgpMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgpMasterKey")
            .field("fingerprint", &self.fingerprint)
            .field("creation_date", &self.creation_date)
            .field("wrapped", &!self.encrypted_key.is_empty())
            .finish()
    }
}

impl fmt::Display for PgpMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

impl PgpMasterKey {
    pub fn new(fingerprint: &str, services: &KeyServices) -> Self {
        Self {
            fingerprint: fingerprint.replace(' ', ""),
            encrypted_key: String::new(),
            creation_date: now_seconds(),
            backend: services.pgp_backend(),
            timeout: services.timeout(),
        }
    }

    pub(crate) fn from_map(entry: &Map<String, JsonValue>, services: &KeyServices) -> Result<Self> {
        Ok(Self {
            fingerprint: required_str(entry, "fp", KEY_TYPE)?.to_string(),
            encrypted_key: required_str(entry, "enc", KEY_TYPE)?.to_string(),
            creation_date: parse_created_at(entry, KEY_TYPE)?,
            backend: services.pgp_backend(),
            timeout: services.timeout(),
        })
    }
}

impl MasterKey for PgpMasterKey {
    fn encrypt(&mut self, data_key: &DataKey) -> Result<()> {
        let armored = self
            .backend
            .encrypt(&self.fingerprint, data_key.as_bytes(), self.timeout)
            .map_err(|e| encryption_error(&self.fingerprint, e))?;
        self.encrypted_key = armored;
        info!(fingerprint = %self.fingerprint, "encryption succeeded");
        Ok(())
    }

    fn decrypt(&self) -> Result<DataKey> {
        let plaintext = self
            .backend
            .decrypt(&self.encrypted_key, self.timeout)
            .map_err(|e| decryption_error(&self.fingerprint, e))?;
        info!(fingerprint = %self.fingerprint, "decryption succeeded");
        DataKey::from_slice(&plaintext)
    }

    fn needs_rotation(&self) -> bool {
        older_than_ttl(&self.creation_date)
    }

    fn to_map(&self) -> Map<String, JsonValue> {
        let mut out = Map::new();
        out.insert("fp".into(), JsonValue::String(self.fingerprint.clone()));
        out.insert("created_at".into(), format_created_at(&self.creation_date));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_fingerprint() {
        assert_eq!(
            short_fingerprint("FBC7B9E2A4F9289AC0C1D4843D16CEE4A27381B4"),
            "3D16CEE4A27381B4"
        );
        assert_eq!(short_fingerprint("ABCD"), "ABCD");
    }

    #[test]
    fn test_fingerprint_spaces_removed() {
        let key = PgpMasterKey::new("FBC7 B9E2 A4F9 289A", &KeyServices::new());
        assert_eq!(key.to_string(), "FBC7B9E2A4F9289A");
    }

    #[test]
    fn test_missing_binary_is_a_key_failure() {
        let backend = GnuPgBackend::from_env().with_binary("/nonexistent/sealtree-gpg");
        let services = KeyServices::new().with_pgp_backend(Arc::new(backend));
        let mut key = PgpMasterKey::new("FBC7B9E2A4F9289A", &services);
        let err = key.encrypt(&DataKey::from_bytes([0u8; 32])).unwrap_err();
        assert!(matches!(err, SealError::KeyEncryption { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_slow_binary_times_out() {
        let backend = GnuPgBackend {
            binary: "sleep".into(),
            home_dir: None,
        };
        let result = backend.run(&["5"], b"", Duration::from_millis(50));
        assert!(matches!(result, Err(SealError::Timeout(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_stdin_write_is_an_error() {
        let backend = GnuPgBackend {
            binary: "true".into(),
            home_dir: None,
        };
        let payload = vec![0u8; 4 << 20];
        let result = backend.run(&[], &payload, Duration::from_secs(5));
        assert!(matches!(result, Err(SealError::Io(_))));
    }

    #[test]
    fn test_rotation_after_ttl() {
        let services = KeyServices::new();
        let mut key = PgpMasterKey::new("85D77543B3D624B63CEA9E6DBC17301B491B3F21", &services);
        assert!(!key.needs_rotation());
        key.creation_date = Utc::now() - chrono::Duration::days(181);
        let back = PgpMasterKey::from_map(&key.to_map(), &services).unwrap();
        assert!(back.needs_rotation());
    }

    #[test]
    fn test_map_round_trip() {
        let services = KeyServices::new();
        let mut key = PgpMasterKey::new("85D77543B3D624B63CEA9E6DBC17301B491B3F21", &services);
        key.encrypted_key = "-----BEGIN PGP MESSAGE-----".into();
        let back = PgpMasterKey::from_map(&key.to_map(), &services).unwrap();
        assert_eq!(back.fingerprint, key.fingerprint);
        assert_eq!(back.encrypted_key, key.encrypted_key);
    }
}
