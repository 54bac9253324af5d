use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use sparrow_state::{
    row, BackendConf, ProviderFactories, StateSchema, StateStoreConf, StateStoreRegistry,
    StoreIdentity, FILE_PROVIDER,
};
use sparrow_state_sled::SLED_PROVIDER;
use sparrow_testing::TempCheckpoint;

fn schema() -> StateSchema {
    let key = Schema::new(vec![Field::new("key", DataType::Utf8, false)]);
    let value = Schema::new(vec![Field::new("value", DataType::Utf8, false)]);
    StateSchema::try_new(Arc::new(key), Arc::new(value), None).unwrap()
}

#[test]
fn test_sled_is_registered() {
    let factories = ProviderFactories::registered();
    assert_eq!(
        factories.names().collect::<Vec<_>>(),
        vec![FILE_PROVIDER, SLED_PROVIDER]
    );
}

#[test]
fn test_registry_uses_configured_provider() {
    sparrow_testing::init_test_logging();
    let checkpoint = TempCheckpoint::try_new().unwrap();
    let registry = StateStoreRegistry::new(None);
    let conf = StateStoreConf::default().with_provider(SLED_PROVIDER);
    let id = StoreIdentity::new(checkpoint.path_str(), 0, 0);

    let mut store = registry
        .get(&id, &schema(), 0, &conf, &BackendConf::new())
        .unwrap();
    store.put(&row!["k"], &row!["v"]).unwrap();
    assert_eq!(store.commit().unwrap(), 1);

    let store = registry
        .get(&id, &schema(), 1, &conf, &BackendConf::new())
        .unwrap();
    assert_eq!(store.get(&row!["k"]).unwrap(), Some(row!["v"]));
    assert!(id.store_path().join("sled").exists());

    registry.unload(&id);
    assert!(!registry.is_loaded(&id));
}
