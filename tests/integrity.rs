//! Tampering with ciphertexts, plaintext values or the MAC is detected.

mod common;

use sealtree::{
    decrypt, encrypt, AuditEvent, AuditLog, JsonStore, Options, SealError, Store, Value,
};

use common::{json_tree, kms_sources, services, FakeKms, ARNS};

fn sealed(kms: &std::sync::Arc<FakeKms>) -> serde_json::Value {
    let services = services(kms);
    let plain = json_tree(
        r#"{"db": {"user": "admin", "password": "hunter2"}, "port": 5432, "region_unencrypted_": "eu"}"#,
    );
    let (branch, metadata) = encrypt(
        plain,
        kms_sources(&services, &ARNS[..1]),
        &Options::default(),
        &mut AuditLog::new(),
    )
    .unwrap();
    serde_json::from_slice(&JsonStore.marshal_with_metadata(&branch, &metadata).unwrap()).unwrap()
}

fn open(kms: &std::sync::Arc<FakeKms>, doc: &serde_json::Value, options: &Options, audit: &mut AuditLog) -> sealtree::Result<sealtree::TreeBranch> {
    let bytes = serde_json::to_vec(doc).unwrap();
    decrypt(&bytes, &JsonStore, &services(kms), options, audit)
}

#[test]
fn test_relocated_ciphertext_fails_authentication() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    let password = doc["db"]["password"].clone();
    doc["db"]["user"] = password;

    let err = open(&kms, &doc, &Options::default(), &mut AuditLog::new()).unwrap_err();
    match err {
        SealError::AuthenticationFailure { path } => assert_eq!(path, "db:user"),
        other => panic!("expected an authentication failure, got {other:?}"),
    }
}

#[test]
fn test_moved_key_fails_authentication() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    let port = doc["port"].clone();
    let object = doc.as_object_mut().unwrap();
    object.remove("port");
    object.insert("listen_port".into(), port);

    let err = open(&kms, &doc, &Options::default(), &mut AuditLog::new()).unwrap_err();
    assert!(matches!(err, SealError::AuthenticationFailure { .. }));
}

#[test]
fn test_edited_plaintext_value_fails_mac() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    doc["region_unencrypted_"] = "us".into();

    let err = open(&kms, &doc, &Options::default(), &mut AuditLog::new()).unwrap_err();
    assert!(matches!(err, SealError::MacMismatch { .. }));
}

#[test]
fn test_removed_value_fails_mac() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    doc["db"].as_object_mut().unwrap().remove("user");

    let err = open(&kms, &doc, &Options::default(), &mut AuditLog::new()).unwrap_err();
    assert!(matches!(err, SealError::MacMismatch { .. }));
}

#[test]
fn test_changed_lastmodified_fails_mac_decryption() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    doc["sops"]["lastmodified"] = "2001-01-01T00:00:00Z".into();

    let err = open(&kms, &doc, &Options::default(), &mut AuditLog::new()).unwrap_err();
    match err {
        SealError::AuthenticationFailure { path } => assert_eq!(path, "sops:mac"),
        other => panic!("expected an authentication failure, got {other:?}"),
    }
}

#[test]
fn test_ignore_mac_warns_and_audits() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    doc["region_unencrypted_"] = "us".into();

    let options = Options {
        ignore_mac: true,
        ..Options::default()
    };
    let mut audit = AuditLog::new();
    let branch = open(&kms, &doc, &options, &mut audit).unwrap();
    assert_eq!(branch.get_key("region_unencrypted_"), Some(&Value::string("us")));
    assert!(audit.iter().any(|r| r.event == AuditEvent::MacMismatchIgnored));
}

#[test]
fn test_ignore_mac_does_not_hide_value_tampering() {
    let kms = FakeKms::new();
    let mut doc = sealed(&kms);
    let password = doc["db"]["password"].clone();
    doc["db"]["user"] = password;

    let options = Options {
        ignore_mac: true,
        ..Options::default()
    };
    let err = open(&kms, &doc, &options, &mut AuditLog::new()).unwrap_err();
    assert!(matches!(err, SealError::AuthenticationFailure { .. }));
}

#[test]
fn test_plaintext_document_reports_missing_metadata() {
    let kms = FakeKms::new();
    let err = decrypt(
        br#"{"a": "b"}"#,
        &JsonStore,
        &services(&kms),
        &Options::default(),
        &mut AuditLog::new(),
    )
    .unwrap_err();
    assert!(matches!(err, SealError::MetadataNotFound));
}

#[test]
fn test_reserved_key_in_plaintext_is_rejected() {
    let branch = JsonStore.unmarshal(br#"{"a": "b"}"#).unwrap();
    let mut with_reserved = branch.clone();
    with_reserved.insert_or_replace("sops", Value::string("oops"));
    let kms = FakeKms::new();
    let services = services(&kms);
    let (encrypted, metadata) = encrypt(
        with_reserved,
        kms_sources(&services, &ARNS[..1]),
        &Options::default(),
        &mut AuditLog::new(),
    )
    .unwrap();
    assert!(JsonStore.marshal_with_metadata(&encrypted, &metadata).is_err());
}
