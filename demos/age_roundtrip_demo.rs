//! Minimal example: encrypt a JSON document for an age recipient.
//!
//! Writes an encrypted file and a JSON-lines audit log to the temp dir, then
//! reads the file back and decrypts it.
//! Run with: `cargo run --example age_roundtrip_demo`

use std::path::PathBuf;

use sealtree::keysource::age::KEY_TYPE;
use sealtree::{
    encrypt, AuditLog, Document, FileAuditSink, JsonStore, KeyServices, KeySource, Options, Store,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Key services: one local age identity.
    let identity = age::x25519::Identity::generate();
    let recipient = identity.to_public().to_string();
    let services = KeyServices::new().with_age_identities(vec![identity]);

    let mut audit = AuditLog::new();
    let audit_path = std::env::temp_dir().join("sealtree_audit.jsonl");
    audit.add_forward_sink(Box::new(FileAuditSink::new(&audit_path)?));

    // 2. Encrypt a plaintext document.
    let plain = JsonStore.unmarshal(
        br#"{"database": {"user": "app", "password": "correct horse"}, "region_unencrypted_": "eu-west-1"}"#,
    )?;
    let sources = vec![KeySource::new(KEY_TYPE, services.age_keys(&recipient)?)];
    let (branch, metadata) = encrypt(plain.clone(), sources, &Options::default(), &mut audit)?;

    let path = PathBuf::from(std::env::temp_dir()).join("sealtree_demo.json");
    Document::new(branch, metadata).save(&path)?;
    println!("Encrypted document written to {}", path.display());
    println!("{}", std::fs::read_to_string(&path)?);

    // 3. Load and decrypt it again.
    let mut document = Document::load(&path, &services)?;
    document.decrypt(&Options::default(), &mut audit)?;
    assert_eq!(document.branch, plain);
    println!("Decrypted: {}", String::from_utf8(JsonStore.marshal(&document.branch)?)?);

    println!("Audit log: {} record(s), also in {}", audit.len(), audit_path.display());
    Ok(())
}
