//! Cost of wrapping and unwrapping the data key with an age recipient,
//! compared with a KMS-style client that sleeps for a simulated round trip.
//!
//! Run with: `cargo bench --bench key_wrap_benchmark`

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, SamplingMode};
use sealtree::keysource::{AgeMasterKey, KmsClient, KmsRequest};
use sealtree::{generate_data_key, KeyServices, MasterKey};

/// Simulated KMS RTT per API call.
const KMS_SIMULATED_RTT_MS: u64 = 15;

struct SleepyKms;

impl KmsClient for SleepyKms {
    fn encrypt(&self, request: &KmsRequest<'_>) -> sealtree::Result<Vec<u8>> {
        thread::sleep(Duration::from_millis(KMS_SIMULATED_RTT_MS));
        Ok(request.payload.to_vec())
    }

    fn decrypt(&self, request: &KmsRequest<'_>) -> sealtree::Result<Vec<u8>> {
        thread::sleep(Duration::from_millis(KMS_SIMULATED_RTT_MS));
        Ok(request.payload.to_vec())
    }
}

fn bench_key_wrap(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_wrap");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(20);

    let data_key = generate_data_key().unwrap();

    let identity = age::x25519::Identity::generate();
    let recipient = identity.to_public().to_string();
    let services = KeyServices::new()
        .with_age_identities(vec![identity])
        .with_kms_client(Arc::new(SleepyKms));

    let mut age_key = AgeMasterKey::new(&recipient, &services).unwrap();
    group.bench_function("age_wrap", |b| {
        b.iter(|| age_key.encrypt(black_box(&data_key)).unwrap());
    });
    group.bench_function("age_unwrap", |b| {
        b.iter(|| black_box(age_key.decrypt().unwrap()));
    });

    let mut kms_keys = services
        .kms_keys("arn:aws:kms:us-east-1:111111111111:key/bench", BTreeMap::new(), None)
        .unwrap();
    let kms_key = &mut kms_keys[0];
    group.bench_function("kms_style_wrap_simulated", |b| {
        b.iter(|| kms_key.encrypt(black_box(&data_key)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_key_wrap);
criterion_main!(benches);
