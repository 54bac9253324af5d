#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

//! State store provider keeping each version of a store in a sled tree.
//!
//! Linking this crate registers the provider as [SLED_PROVIDER].

use std::sync::Arc;

use error_stack::{IntoReport, ResultExt};
use sparrow_state::{
    range_scan, BackendConf, Error, Row, RowPairs, StateSchema, StateStore, StateStoreConf,
    StateStoreMetrics, StateStoreProvider, StoreDelta, StoreIdentity, StorePath, StoreStatus,
};

/// Name the sled provider is registered as.
pub const SLED_PROVIDER: &str = "sled";

fn create() -> Box<dyn StateStoreProvider> {
    Box::<SledStateStoreProvider>::default()
}

inventory::submit!(sparrow_state::ProviderRegistration {
    name: SLED_PROVIDER,
    create: &create
});

/// Sled tree recording the committed versions and their number of keys.
const VERSIONS_TREE: &str = "versions";

fn version_tree_name(version: i64) -> String {
    format!("version-{version:020}")
}

#[derive(Default)]
pub struct SledStateStoreProvider {
    backend: Option<Arc<SledBackend>>,
}

struct SledBackend {
    id: StoreIdentity,
    schema: StateSchema,
    db: sled::Db,
    versions: sled::Tree,
    min_versions_to_retain: usize,
}

impl SledStateStoreProvider {
    fn backend(&self) -> error_stack::Result<&Arc<SledBackend>, Error> {
        self.backend
            .as_ref()
            .ok_or_else(|| error_stack::report!(Error::ProviderNotInitialized))
    }
}

impl StateStoreProvider for SledStateStoreProvider {
    fn init(
        &mut self,
        id: StoreIdentity,
        schema: StateSchema,
        conf: &StateStoreConf,
        _backend_conf: &BackendConf,
    ) -> error_stack::Result<(), Error> {
        error_stack::ensure!(self.backend.is_none(), Error::ProviderAlreadyInitialized);

        let path = id.store_path().join("sled");
        let db = sled::open(&path)
            .into_report()
            .change_context(Error::CreateBackend)
            .attach_printable_lazy(|| StorePath::new(&path))?;
        let versions = db
            .open_tree(VERSIONS_TREE)
            .into_report()
            .change_context(Error::CreateBackend)?;
        tracing::info!("Opened sled state store for {id} in {path:?}");

        self.backend = Some(Arc::new(SledBackend {
            id,
            schema,
            db,
            versions,
            min_versions_to_retain: conf.min_versions_to_retain,
        }));
        Ok(())
    }

    fn id(&self) -> Option<&StoreIdentity> {
        self.backend.as_ref().map(|backend| &backend.id)
    }

    fn get_store(&self, version: i64) -> error_stack::Result<Box<dyn StateStore>, Error> {
        let backend = self.backend()?;
        error_stack::ensure!(version >= 0, Error::InvalidVersion(version));

        let store = match backend.num_keys(version)? {
            Some(num_keys) => {
                let tree = backend.open_version(version)?;
                SledStateStore::new(backend.clone(), version, Some(tree), num_keys)
            }
            None if version == 0 => SledStateStore::new(backend.clone(), version, None, 0),
            None => error_stack::bail!(Error::VersionNotFound {
                id: backend.id.clone(),
                version
            }),
        };
        Ok(Box::new(store))
    }

    fn do_maintenance(&self) -> error_stack::Result<(), Error> {
        self.backend()?.drop_old_versions()
    }

    fn close(&self) -> error_stack::Result<(), Error> {
        match &self.backend {
            Some(backend) => backend.flush(),
            None => Ok(()),
        }
    }
}

impl SledBackend {
    /// The number of keys in the version, or `None` if it wasn't committed.
    fn num_keys(&self, version: i64) -> error_stack::Result<Option<usize>, Error> {
        let num_keys = self
            .versions
            .get(version.to_be_bytes())
            .into_report()
            .change_context(Error::Backend("get"))?;
        num_keys.map(|bytes| decode::<u64>(&bytes).map(|n| n as usize)).transpose()
    }

    fn open_version(&self, version: i64) -> error_stack::Result<sled::Tree, Error> {
        self.db
            .open_tree(version_tree_name(version))
            .into_report()
            .change_context(Error::Backend("open_tree"))
    }

    fn flush(&self) -> error_stack::Result<(), Error> {
        self.db
            .flush()
            .into_report()
            .change_context(Error::Backend("flush"))?;
        Ok(())
    }

    /// Write the tree of a new version, containing the base plus the delta.
    fn write_version(
        &self,
        version: i64,
        base: Option<&sled::Tree>,
        delta: &StoreDelta,
        num_keys: usize,
    ) -> error_stack::Result<(), Error> {
        let mut batch = sled::Batch::default();
        if let Some(base) = base {
            for entry in base.iter() {
                let (key, value) = entry
                    .into_report()
                    .change_context(Error::Backend("iter"))?;
                batch.insert(key, value);
            }
        }
        for (key, value) in delta.changes() {
            let key = encode(key)?;
            match value {
                Some(value) => batch.insert(key, encode(value)?),
                None => batch.remove(key),
            }
        }

        // A failed attempt may have left rows in the tree before the version
        // was recorded.
        let tree = self.open_version(version)?;
        tree.clear()
            .into_report()
            .change_context(Error::Backend("clear"))?;
        tree.apply_batch(batch)
            .into_report()
            .change_context(Error::Backend("apply_batch"))?;
        self.versions
            .insert(version.to_be_bytes(), encode(&(num_keys as u64))?)
            .into_report()
            .change_context(Error::Backend("insert"))?;
        self.flush()
    }

    /// Drop the trees of versions older than the retained versions.
    fn drop_old_versions(&self) -> error_stack::Result<(), Error> {
        let mut committed = Vec::new();
        for entry in self.versions.iter().keys() {
            let key = entry
                .into_report()
                .change_context(Error::Backend("iter"))?;
            let bytes: [u8; 8] = key
                .as_ref()
                .try_into()
                .into_report()
                .change_context(Error::Deserialize)?;
            committed.push(i64::from_be_bytes(bytes));
        }

        let retained = self.min_versions_to_retain.max(1);
        if committed.len() <= retained {
            return Ok(());
        }

        // Keys are big-endian, so versions are listed in increasing order.
        let obsolete = &committed[..committed.len() - retained];
        for version in obsolete {
            self.versions
                .remove(version.to_be_bytes())
                .into_report()
                .change_context(Error::Backend("remove"))?;
            self.db
                .drop_tree(version_tree_name(*version))
                .into_report()
                .change_context(Error::Backend("drop_tree"))?;
        }
        tracing::info!("Dropped {} old versions of {}", obsolete.len(), self.id);
        self.flush()
    }
}

fn encode<T: serde::Serialize>(value: &T) -> error_stack::Result<Vec<u8>, Error> {
    bincode::serialize(value)
        .into_report()
        .change_context(Error::Serialize)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> error_stack::Result<T, Error> {
    bincode::deserialize(bytes)
        .into_report()
        .change_context(Error::Deserialize)
}

struct SledStateStore {
    backend: Arc<SledBackend>,
    version: i64,
    /// The tree of the base version. `None` for the initial, empty version.
    base: Option<sled::Tree>,
    delta: StoreDelta,
    num_keys: usize,
    status: StoreStatus,
}

impl SledStateStore {
    fn new(
        backend: Arc<SledBackend>,
        version: i64,
        base: Option<sled::Tree>,
        num_keys: usize,
    ) -> Self {
        Self {
            backend,
            version,
            base,
            delta: StoreDelta::default(),
            num_keys,
            status: StoreStatus::Updating,
        }
    }

    fn lookup(&self, key: &Row) -> error_stack::Result<Option<Row>, Error> {
        if let Some(value) = self.delta.get(key) {
            return Ok(value.cloned());
        }
        let Some(base) = &self.base else {
            return Ok(None);
        };

        let value = base
            .get(encode(key)?)
            .into_report()
            .change_context(Error::Backend("get"))?;
        value.map(|bytes| decode(&bytes)).transpose()
    }
}

impl StateStore for SledStateStore {
    fn id(&self) -> &StoreIdentity {
        &self.backend.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn get(&self, key: &Row) -> error_stack::Result<Option<Row>, Error> {
        self.backend.schema.validate_key(key)?;
        self.lookup(key)
    }

    fn put(&mut self, key: &Row, value: &Row) -> error_stack::Result<(), Error> {
        self.status.ensure_updating("put")?;
        self.backend.schema.validate_key(key)?;
        self.backend.schema.validate_value(value)?;

        if self.lookup(key)?.is_none() {
            self.num_keys += 1;
        }
        self.delta.put(key.clone(), value.clone());
        Ok(())
    }

    fn remove(&mut self, key: &Row) -> error_stack::Result<(), Error> {
        self.status.ensure_updating("remove")?;
        self.backend.schema.validate_key(key)?;

        if self.lookup(key)?.is_some() {
            self.num_keys -= 1;
            self.delta.remove(key.clone());
        }
        Ok(())
    }

    fn get_range(
        &self,
        start: Option<&Row>,
        end: Option<&Row>,
    ) -> error_stack::Result<RowPairs, Error> {
        Ok(range_scan(&self.backend.schema, self.iter()?, start, end))
    }

    fn iter(&self) -> error_stack::Result<RowPairs, Error> {
        let mut base = Vec::with_capacity(self.num_keys);
        if let Some(tree) = &self.base {
            for entry in tree.iter() {
                let (key, value) = entry
                    .into_report()
                    .change_context(Error::Backend("iter"))?;
                base.push((decode(&key)?, decode(&value)?));
            }
        }
        Ok(self.delta.merge_over(base.into_iter()))
    }

    fn commit(&mut self) -> error_stack::Result<i64, Error> {
        self.status.ensure_updating("commit")?;

        let version = self.version + 1;
        let result = match self.backend.num_keys(version) {
            Ok(Some(_)) => {
                tracing::info!(
                    "Version {version} of {} was already committed",
                    self.backend.id
                );
                Ok(())
            }
            Ok(None) => {
                self.backend
                    .write_version(version, self.base.as_ref(), &self.delta, self.num_keys)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.status = StoreStatus::Committed;
                Ok(version)
            }
            Err(e) => {
                self.status = StoreStatus::Aborted;
                Err(e).change_context_lazy(|| Error::Commit {
                    id: self.backend.id.clone(),
                    version,
                })
            }
        }
    }

    fn abort(&mut self) -> error_stack::Result<(), Error> {
        if self.status == StoreStatus::Aborted {
            return Ok(());
        }
        self.status.ensure_updating("abort")?;

        self.delta = StoreDelta::default();
        self.num_keys = match self.backend.num_keys(self.version) {
            Ok(num_keys) => num_keys.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(
                    "Failed to read the number of keys in version {} of {}: {e:?}",
                    self.version,
                    self.backend.id
                );
                0
            }
        };
        self.status = StoreStatus::Aborted;
        Ok(())
    }

    fn num_keys(&self) -> usize {
        self.num_keys
    }

    fn has_committed(&self) -> bool {
        self.status == StoreStatus::Committed
    }

    fn metrics(&self) -> StateStoreMetrics {
        let memory_used_bytes = self
            .delta
            .changes()
            .map(|(key, value)| key.estimated_size() + value.map_or(0, Row::estimated_size))
            .sum();
        let size_on_disk = self.backend.db.size_on_disk().unwrap_or_default();

        StateStoreMetrics {
            num_keys: self.num_keys,
            memory_used_bytes,
            custom_metrics: vec![
                ("size_on_disk", size_on_disk),
                ("committed_versions", self.backend.versions.len() as u64),
            ],
        }
    }
}
