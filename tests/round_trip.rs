//! Encrypt/decrypt round trips through the JSON store.

mod common;

use proptest::prelude::*;

use sealtree::cipher;
use sealtree::{
    decrypt, encrypt, AuditEvent, AuditLog, JsonStore, Options, Scalar, Store, TreeBranch, TreeItem,
    Value,
};

use common::{json_tree, json_value, kms_sources, services, FakeKms, ARNS};

#[test]
fn test_suffix_scenario() {
    let kms = FakeKms::new();
    let services = services(&kms);
    let mut audit = AuditLog::new();
    let plain = json_tree(r#"{"foo": "bar", "baz_unencrypted_": "visible"}"#);

    let (branch, metadata) = encrypt(
        plain.clone(),
        kms_sources(&services, &ARNS[..1]),
        &Options::default(),
        &mut audit,
    )
    .unwrap();
    let bytes = JsonStore.marshal_with_metadata(&branch, &metadata).unwrap();
    let doc = json_value(&bytes);

    let foo = doc["foo"].as_str().unwrap();
    assert!(cipher::is_envelope(foo));
    assert!(foo.ends_with(",type:str]"));
    assert_eq!(doc["baz_unencrypted_"], "visible");
    assert_eq!(doc["sops"]["unencrypted_suffix"], "unencrypted_");
    assert!(cipher::is_envelope(doc["sops"]["mac"].as_str().unwrap()));
    assert_eq!(doc["sops"]["kms"][0]["arn"], ARNS[0]);

    let decrypted = decrypt(&bytes, &JsonStore, &services, &Options::default(), &mut audit).unwrap();
    assert_eq!(decrypted, plain);
    assert_eq!(
        JsonStore.marshal(&decrypted).unwrap(),
        JsonStore.marshal(&plain).unwrap()
    );
    assert!(audit
        .iter()
        .any(|r| r.event == AuditEvent::DocumentEncrypted { encrypted_values: 1 }));
}

#[test]
fn test_types_and_layout_survive() {
    let kms = FakeKms::new();
    let services = services(&kms);
    let mut audit = AuditLog::new();
    let input = r#"{
        "name": "api",
        "replicas": 3,
        "ratio": 0.25,
        "enabled": true,
        "empty": "",
        "nothing": null,
        "nested": {"list": [1, "two", false, {"deep": "x"}]}
    }"#;
    let plain = json_tree(input);

    let (branch, metadata) = encrypt(
        plain.clone(),
        kms_sources(&services, &ARNS),
        &Options::default(),
        &mut audit,
    )
    .unwrap();
    let bytes = JsonStore.marshal_with_metadata(&branch, &metadata).unwrap();
    let doc = json_value(&bytes);
    assert!(doc["replicas"].as_str().unwrap().ends_with("type:int]"));
    assert!(doc["ratio"].as_str().unwrap().ends_with("type:float]"));
    assert!(doc["enabled"].as_str().unwrap().ends_with("type:bool]"));
    assert_eq!(doc["empty"], "");
    assert!(doc["nothing"].is_null());

    let keys: Vec<&str> = doc.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec!["name", "replicas", "ratio", "enabled", "empty", "nothing", "nested", "sops"]
    );

    let decrypted = decrypt(&bytes, &JsonStore, &services, &Options::default(), &mut audit).unwrap();
    assert_eq!(decrypted, plain);
}

#[test]
fn test_each_encryption_uses_fresh_nonces() {
    let kms = FakeKms::new();
    let services = services(&kms);
    let plain = json_tree(r#"{"a": "same", "b": "same"}"#);
    let (branch, _) = encrypt(
        plain,
        kms_sources(&services, &ARNS[..1]),
        &Options::default(),
        &mut AuditLog::new(),
    )
    .unwrap();
    assert_ne!(branch.get_key("a"), branch.get_key("b"));
}

fn scalar_strategy() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        "\\PC{0,24}".prop_map(Scalar::String),
        any::<i64>().prop_map(Scalar::Int),
        any::<bool>().prop_map(Scalar::Bool),
        (-1_000_000i32..1_000_000).prop_map(|n| Scalar::Float(f64::from(n) / 8.0)),
    ]
}

fn tree_strategy() -> impl Strategy<Value = TreeBranch> {
    let leaf = scalar_strategy().prop_map(Value::Scalar);
    let value = leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
            prop::collection::btree_map("[a-n]{1,6}", inner, 0..4).prop_map(|m| {
                Value::Branch(TreeBranch(
                    m.into_iter().map(|(k, v)| TreeItem::new(k, v)).collect(),
                ))
            }),
        ]
    });
    prop::collection::btree_map("[a-n]{1,6}", value, 1..6)
        .prop_map(|m| TreeBranch(m.into_iter().map(|(k, v)| TreeItem::new(k, v)).collect()))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_round_trip(plain in tree_strategy()) {
        let kms = FakeKms::new();
        let services = services(&kms);
        let mut audit = AuditLog::new();
        let (branch, metadata) = encrypt(
            plain.clone(),
            kms_sources(&services, &ARNS[..2]),
            &Options::default(),
            &mut audit,
        )
        .unwrap();
        let bytes = JsonStore.marshal_with_metadata(&branch, &metadata).unwrap();
        let decrypted = decrypt(&bytes, &JsonStore, &services, &Options::default(), &mut audit).unwrap();
        prop_assert_eq!(decrypted, plain);
    }
}
