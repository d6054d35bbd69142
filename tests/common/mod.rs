//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use sealtree::keysource::{KmsClient, KmsRequest};
use sealtree::{JsonStore, KeyServices, KeySource, SealError, Store, TreeBranch};

pub const ARNS: [&str; 3] = [
    "arn:aws:kms:us-east-1:111111111111:key/one",
    "arn:aws:kms:eu-west-1:222222222222:key/two",
    "arn:aws:kms:ap-south-1:333333333333:alias/three",
];

/// In-memory KMS. Wrapping XORs the payload and prefixes the key ARN, so a
/// blob only unwraps under the key that produced it.
#[derive(Default)]
pub struct FakeKms {
    unreachable: Mutex<HashSet<String>>,
}

impl FakeKms {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reachable(&self, arn: &str, reachable: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if reachable {
            unreachable.remove(arn);
        } else {
            unreachable.insert(arn.to_string());
        }
    }

    fn check(&self, arn: &str) -> sealtree::Result<()> {
        if self.unreachable.lock().unwrap().contains(arn) {
            return Err(SealError::KeyDecryption {
                key: arn.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

impl KmsClient for FakeKms {
    fn encrypt(&self, request: &KmsRequest<'_>) -> sealtree::Result<Vec<u8>> {
        self.check(request.key_arn)?;
        let mut blob = request.key_arn.as_bytes().to_vec();
        blob.push(b'|');
        blob.extend(request.payload.iter().map(|b| b ^ 0x5A));
        Ok(blob)
    }

    fn decrypt(&self, request: &KmsRequest<'_>) -> sealtree::Result<Vec<u8>> {
        self.check(request.key_arn)?;
        let prefix_len = request.key_arn.len() + 1;
        if request.payload.len() < prefix_len || &request.payload[..request.key_arn.len()] != request.key_arn.as_bytes() {
            return Err(SealError::KeyDecryption {
                key: request.key_arn.to_string(),
                reason: "blob was wrapped by another key".into(),
            });
        }
        Ok(request.payload[prefix_len..].iter().map(|b| b ^ 0x5A).collect())
    }
}

pub fn services(kms: &Arc<FakeKms>) -> KeyServices {
    KeyServices::new().with_kms_client(kms.clone())
}

pub fn kms_sources(services: &KeyServices, arns: &[&str]) -> Vec<KeySource> {
    let keys = services
        .kms_keys(&arns.join(","), BTreeMap::new(), None)
        .unwrap();
    vec![KeySource::new("kms", keys)]
}

pub fn json_tree(text: &str) -> TreeBranch {
    JsonStore.unmarshal(text.as_bytes()).unwrap()
}

pub fn json_value(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap()
}
