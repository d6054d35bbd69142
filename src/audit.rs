//! Immutable audit logging.
//!
//! Records every document operation and every master key that failed to
//! unwrap the data key. The log is append-only and supports pluggable sinks
//! for forwarding records to files or other stores.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A sink that receives audit records. Implement this to forward records
/// to a file, database, or other persistent store.
pub trait AuditSink: Send {
    /// Append a record. Called for every event.
    fn append(&mut self, record: AuditRecord);
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A master key unwrapped the data key.
    DataKeyRetrieved { key_type: String, key: String },
    /// A master key failed to unwrap or wrap the data key.
    MasterKeyFailed {
        key_type: String,
        key: String,
        reason: String,
    },
    DocumentEncrypted { encrypted_values: usize },
    DocumentDecrypted { decrypted_values: usize },
    DocumentRotated { master_keys: usize },
    /// A MAC mismatch was tolerated because `ignore_mac` is set.
    MacMismatchIgnored,
    MasterKeysAdded { source: String, keys: Vec<String> },
    MasterKeysRemoved { keys: Vec<String> },
}

/// A permanent record of one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(flatten)]
    pub event: AuditEvent,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn now(event: AuditEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }
}

/// An append-only log of all events.
/// Can forward records to additional sinks via `add_forward_sink`.
#[derive(Default, Serialize, Deserialize)]
pub struct AuditLog {
    records: Vec<AuditRecord>,
    #[serde(skip)]
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl Clone for AuditLog {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            forward_sinks: Vec::new(), // Forward sinks are not cloned
        }
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every record, without replacing the
    /// in-memory log.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a new record to the log and forward to any attached sinks.
    pub fn append(&mut self, record: AuditRecord) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }
        self.records.push(record);
    }

    /// Shorthand for appending an event stamped with the current time.
    pub fn record(&mut self, event: AuditEvent) {
        self.append(AuditRecord::now(event));
    }

    /// Return the number of records in the log.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate over the records.
    pub fn iter(&self) -> std::slice::Iter<'_, AuditRecord> {
        self.records.iter()
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        match serde_json::to_string(&record) {
            Ok(line) => {
                if let Err(e) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
                    tracing::warn!(error = %e, "failed to write audit record");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize audit record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<AuditRecord>>>);

    impl AuditSink for Collect {
        fn append(&mut self, record: AuditRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    #[test]
    fn test_forward_sink_receives_copies() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut log = AuditLog::new();
        log.add_forward_sink(Box::new(Collect(seen.clone())));
        log.record(AuditEvent::MacMismatchIgnored);
        assert_eq!(log.len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_record_serializes_with_event_tag() {
        let record = AuditRecord::now(AuditEvent::DocumentRotated { master_keys: 2 });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "document_rotated");
        assert_eq!(json["master_keys"], 2);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_clone_drops_sinks() {
        let mut log = AuditLog::new();
        log.add_forward_sink(Box::new(Collect(Arc::new(Mutex::new(Vec::new())))));
        log.record(AuditEvent::MacMismatchIgnored);
        let copy = log.clone();
        assert_eq!(copy.len(), 1);
        assert_eq!(format!("{copy:?}").contains("forward_sinks: 0"), true);
    }
}
