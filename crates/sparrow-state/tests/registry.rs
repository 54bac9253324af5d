use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema};
use sparrow_state::{
    row, BackendConf, ClusterContext, Error, LocalCoordinator, StateSchema, StateStoreConf,
    StateStoreCoordinator, StateStoreRegistry, StoreIdentity,
};
use sparrow_testing::TempCheckpoint;

fn schema() -> StateSchema {
    let key = Schema::new(vec![
        Field::new("entity", DataType::Utf8, false),
        Field::new("window_end", DataType::Int64, false),
    ]);
    let value = Schema::new(vec![
        Field::new("count", DataType::UInt64, false),
        Field::new("last", DataType::Utf8, true),
    ]);
    StateSchema::try_new(Arc::new(key), Arc::new(value), Some(1)).unwrap()
}

fn count_events(
    registry: &StateStoreRegistry,
    id: &StoreIdentity,
    version: i64,
    events: &[(&str, i64)],
) -> i64 {
    let conf = StateStoreConf::default();
    let mut store = registry
        .get(id, &schema(), version, &conf, &BackendConf::new())
        .unwrap();
    for (entity, window_end) in events {
        let key = row![*entity, *window_end];
        let count = match store.get(&key).unwrap() {
            Some(value) => match value.get(0) {
                Some(sparrow_state::Datum::UInt64(count)) => *count,
                other => panic!("unexpected count {other:?}"),
            },
            None => 0,
        };
        store.put(&key, &row![count + 1, *entity]).unwrap();
    }
    store.commit().unwrap()
}

#[test]
fn test_state_survives_registry_restart() {
    sparrow_testing::init_test_logging();
    let checkpoint = TempCheckpoint::try_new().unwrap();
    let id = StoreIdentity::new(checkpoint.path_str(), 2, 5).with_name("counts");

    let version = {
        let registry = StateStoreRegistry::new(None);
        let version = count_events(&registry, &id, 0, &[("a", 10), ("b", 10), ("a", 10)]);
        count_events(&registry, &id, version, &[("a", 20), ("b", 10)])
    };
    assert_eq!(version, 2);
    assert!(id.store_path().exists());

    let registry = StateStoreRegistry::new(None);
    let store = registry
        .get(
            &id,
            &schema(),
            version,
            &StateStoreConf::default(),
            &BackendConf::new(),
        )
        .unwrap();
    assert_eq!(store.num_keys(), 3);
    assert_eq!(store.get(&row!["a", 10i64]).unwrap(), Some(row![2u64, "a"]));
    assert_eq!(store.get(&row!["b", 10i64]).unwrap(), Some(row![2u64, "b"]));

    let windows: Vec<_> = store
        .get_range(Some(&row!["", 15i64]), None)
        .unwrap()
        .collect();
    assert_eq!(windows, vec![(row!["a", 20i64], row![1u64, "a"])]);

    let Err(err) = registry.get(
        &id,
        &schema(),
        version + 1,
        &StateStoreConf::default(),
        &BackendConf::new(),
    ) else {
        panic!("expected missing version")
    };
    assert!(matches!(
        err.current_context(),
        Error::VersionNotFound { version: 3, .. }
    ));
}

#[test]
fn test_store_moves_between_executors() {
    sparrow_testing::init_test_logging();
    let checkpoint = TempCheckpoint::try_new().unwrap();
    let coordinator = LocalCoordinator::new();
    let first = StateStoreRegistry::new(Some(ClusterContext::with_coordinator(
        "host-1",
        "exec-1",
        coordinator.clone(),
    )));
    let second = StateStoreRegistry::new(Some(ClusterContext::with_coordinator(
        "host-2",
        "exec-2",
        coordinator.clone(),
    )));
    let id = StoreIdentity::new(checkpoint.path_str(), 0, 0);

    let version = count_events(&first, &id, 0, &[("a", 1)]);
    assert!(coordinator.verify_if_instance_active(&id, "exec-1").unwrap());

    // The store is rescheduled to the second executor.
    let version = count_events(&second, &id, version, &[("a", 1)]);
    assert_eq!(version, 2);
    assert_eq!(
        coordinator.get_location(&id).unwrap().to_string(),
        "executor_host-2_exec-2"
    );

    first.do_maintenance().unwrap();
    assert!(!first.is_loaded(&id));
    second.do_maintenance().unwrap();
    assert!(second.is_loaded(&id));

    // Once the query stops, no executor is considered active.
    coordinator.deactivate_instances(checkpoint.path_str());
    second.do_maintenance().unwrap();
    assert!(!second.is_loaded(&id));
}

#[test]
fn test_maintenance_writes_snapshots() {
    sparrow_testing::init_test_logging();
    let checkpoint = TempCheckpoint::try_new().unwrap();
    let coordinator = LocalCoordinator::new();
    let registry = StateStoreRegistry::new(Some(ClusterContext::with_coordinator(
        "host", "exec", coordinator,
    )));
    let id = StoreIdentity::new(checkpoint.path_str(), 1, 3);

    let mut version = 0;
    for window_end in 0..10 {
        version = count_events(&registry, &id, version, &[("a", window_end)]);
    }
    registry.do_maintenance().unwrap();

    let files = TempCheckpoint::file_names(&id.store_path()).unwrap();
    assert!(files.contains(&"10.snapshot".to_owned()), "{files:?}");
    assert_eq!(files.iter().filter(|name| name.ends_with(".delta")).count(), 10);
}
