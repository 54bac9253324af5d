use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use criterion::{criterion_group, criterion_main, Criterion};
use sparrow_state::{
    row, BackendConf, StateSchema, StateStore, StateStoreConf, StateStoreProvider, StoreIdentity,
};
use sparrow_state_sled::SledStateStoreProvider;
use sparrow_testing::TempCheckpoint;

fn setup_entity_keys() -> Vec<u64> {
    let mut keys = Vec::new();
    for i in 0..1000 {
        let key = i % 4;
        keys.push(key);
        if key == 0 {
            keys.push(key);
        }
    }
    keys
}

fn open_provider(checkpoint: &TempCheckpoint) -> SledStateStoreProvider {
    let key = Schema::new(vec![Field::new("key", DataType::UInt64, false)]);
    let value = Schema::new(vec![Field::new("sum", DataType::UInt64, false)]);
    let schema = StateSchema::try_new(Arc::new(key), Arc::new(value), None).unwrap();

    let mut provider = SledStateStoreProvider::default();
    provider
        .init(
            StoreIdentity::new(checkpoint.path_str(), 0, 0),
            schema,
            &StateStoreConf::default(),
            &BackendConf::new(),
        )
        .unwrap();

    // Commit a base version so reads go to the sled tree.
    let mut store = provider.get_store(0).unwrap();
    for key in 0..4u64 {
        store.put(&row![key], &row![1u64]).unwrap();
    }
    store.commit().unwrap();
    provider
}

fn rw_value(store: &mut dyn StateStore, keys: &[u64]) -> u64 {
    let mut sum = 0;
    for key in keys {
        let key = row![*key];
        let value = match store.get(&key).unwrap() {
            Some(value) => match value.get(0) {
                Some(sparrow_state::Datum::UInt64(value)) => *value,
                _ => 0,
            },
            None => 0,
        };
        sum += value;
        store.put(&key, &row![value * 2]).unwrap();
    }

    store.abort().unwrap();
    sum
}

fn w_value(store: &mut dyn StateStore, keys: &[u64]) {
    let mut sum = 0;
    for key in keys {
        sum += *key;
        store.put(&row![*key], &row![sum]).unwrap();
    }

    store.abort().unwrap();
}

fn commit_value(provider: &SledStateStoreProvider, keys: &[u64]) {
    let mut store = provider.get_store(1).unwrap();
    for key in keys {
        store.put(&row![*key], &row![*key]).unwrap();
    }
    // Only the first commit writes version 2. Later commits find it committed.
    store.commit().unwrap();
}

fn criterion_benchmark(c: &mut Criterion) {
    let checkpoint = TempCheckpoint::try_new().unwrap();
    let provider = open_provider(&checkpoint);

    let input = setup_entity_keys();
    let mut group = c.benchmark_group("Sled");
    let group = group.throughput(criterion::Throughput::Elements(input.len() as u64));
    group.bench_with_input("rw_u64", &input, |b, keys| {
        b.iter(|| {
            let mut store = provider.get_store(1).unwrap();
            rw_value(store.as_mut(), keys)
        })
    });
    group.bench_with_input("w_u64", &input, |b, keys| {
        b.iter(|| {
            let mut store = provider.get_store(1).unwrap();
            w_value(store.as_mut(), keys)
        })
    });
    group.bench_with_input("commit_u64", &input, |b, keys| {
        b.iter(|| commit_value(&provider, keys))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
