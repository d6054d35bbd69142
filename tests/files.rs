//! File-backed workflows: stores picked by file name, configuration files
//! and creation rules.

mod common;

use std::fs;

use sealtree::tree::parse_tree_path;
use sealtree::{
    AuditLog, Document, DotenvStore, Format, JsonStore, MasterKey, Options, SealConfig, SealError,
    Store, Value,
};
use tempfile::TempDir;

use common::{services, FakeKms, ARNS};

fn config_for(dir: &TempDir) -> SealConfig {
    let path = dir.path().join("sealtree.json");
    fs::write(
        &path,
        format!(
            r#"{{
                "key_timeout_secs": 3,
                "creation_rules": [
                    {{"path_regex": "\\.env$", "kms": "{}", "unencrypted_regex": "^PUBLIC_"}},
                    {{"path_regex": "\\.json$", "kms": "{},{}"}}
                ]
            }}"#,
            ARNS[0], ARNS[1], ARNS[2]
        ),
    )
    .unwrap();
    SealConfig::load(&path).unwrap()
}

#[test]
fn test_dotenv_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir);
    let kms = FakeKms::new();
    let services = services(&kms).with_timeout(config.key_timeout());

    let input = "# service settings\nDB_PASSWORD=hunter2\nPUBLIC_URL=https://example.com\nCERT=a\\nb\n";
    let plain = DotenvStore.unmarshal(input.as_bytes()).unwrap();
    let path = dir.path().join("prod.env");

    let mut document =
        Document::for_path(plain.clone(), path.to_str().unwrap(), &config, &services).unwrap();
    let data_key = sealtree::generate_data_key().unwrap();
    document.encrypt(&data_key, &mut AuditLog::new()).unwrap();
    document.save(&path).unwrap();

    let written = fs::read_to_string(&path).unwrap();
    assert!(written.starts_with("# service settings\nDB_PASSWORD=ENC[AES256_GCM,"));
    assert!(written.contains("PUBLIC_URL=https://example.com\n"));
    assert!(written.contains(&format!("sops_kms__list_0__map_arn={}\n", ARNS[0])));
    assert!(written.contains("sops_unencrypted_regex=^PUBLIC_\n"));

    let mut loaded = Document::load(&path, &services).unwrap();
    assert_eq!(loaded.metadata.scope.metadata_key(), "unencrypted_regex");
    loaded.decrypt(&Options::from_config(&config).unwrap(), &mut AuditLog::new()).unwrap();
    assert_eq!(loaded.branch, plain);
    assert_eq!(DotenvStore.marshal(&loaded.branch).unwrap(), input.as_bytes());
}

#[test]
fn test_json_rule_picks_two_keys_and_extract() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir);
    let kms = FakeKms::new();
    let services = services(&kms);

    let plain = JsonStore
        .unmarshal(br#"{"app": {"secrets": ["first", "second"]}, "debug": false}"#)
        .unwrap();
    let path = dir.path().join("app.json");
    let mut document =
        Document::for_path(plain, path.to_str().unwrap(), &config, &services).unwrap();
    assert_eq!(document.metadata.master_keys().count(), 2);

    document
        .encrypt(&sealtree::generate_data_key().unwrap(), &mut AuditLog::new())
        .unwrap();
    document.save(&path).unwrap();

    let mut loaded = Document::load(&path, &services).unwrap();
    loaded.decrypt(&Options::default(), &mut AuditLog::new()).unwrap();

    let store = Format::from_path(&path).unwrap().store();
    let second = loaded
        .extract(&parse_tree_path(r#"["app"]["secrets"][1]"#).unwrap(), store.as_ref())
        .unwrap();
    assert_eq!(second, b"second");
    let debug = loaded
        .extract(&parse_tree_path(r#"["debug"]"#).unwrap(), store.as_ref())
        .unwrap();
    assert_eq!(debug, b"false");
}

#[test]
fn test_edit_and_reencrypt_with_same_data_key() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir);
    let kms = FakeKms::new();
    let services = services(&kms);
    let path = dir.path().join("edit.json");

    let plain = JsonStore.unmarshal(br#"{"token": "old"}"#).unwrap();
    let mut document = Document::for_path(plain, path.to_str().unwrap(), &config, &services).unwrap();
    document
        .encrypt(&sealtree::generate_data_key().unwrap(), &mut AuditLog::new())
        .unwrap();
    let wrapped: Vec<String> = document
        .metadata
        .master_keys()
        .map(|k| k.encrypted_data_key().to_string())
        .collect();

    let data_key = document.decrypt(&Options::default(), &mut AuditLog::new()).unwrap();
    document.branch.insert_or_replace("token", Value::string("new"));
    document.encrypt(&data_key, &mut AuditLog::new()).unwrap();
    document.save(&path).unwrap();

    let mut loaded = Document::load(&path, &services).unwrap();
    let rewrapped: Vec<String> = loaded
        .metadata
        .master_keys()
        .map(|k| k.encrypted_data_key().to_string())
        .collect();
    assert_eq!(wrapped, rewrapped);
    loaded.decrypt(&Options::default(), &mut AuditLog::new()).unwrap();
    assert_eq!(loaded.branch.get_key("token"), Some(&Value::string("new")));
}

#[test]
fn test_unmatched_path_has_no_rule() {
    let dir = TempDir::new().unwrap();
    let config = config_for(&dir);
    let kms = FakeKms::new();
    let err = Document::for_path(
        Default::default(),
        "notes.txt",
        &config,
        &services(&kms),
    )
    .unwrap_err();
    assert!(matches!(err, SealError::Config(_)));
}

#[test]
fn test_missing_config_file() {
    let dir = TempDir::new().unwrap();
    let err = SealConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, SealError::Io(_)));
}
