//! State stores persisted as delta and snapshot files.
//!
//! Each committed version `v` writes `<v>.delta` to the directory of the
//! store, containing the changes made by the batch producing `v`.
//! Maintenance periodically writes `<v>.snapshot` containing the full state,
//! and deletes files no longer needed to recover recent versions.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    BackendConf, Error, StateSchema, StateStore, StateStoreConf, StateStoreProvider,
    StoreIdentity,
};

mod files;
mod store;

use files::{FileKind, StateMap, StoreFile, StoreFiles};
use store::FileStateStore;

/// Name of the file provider, and the default provider.
pub const FILE_PROVIDER: &str = "file";

fn create() -> Box<dyn StateStoreProvider> {
    Box::<FileStateStoreProvider>::default()
}

inventory::submit!(crate::ProviderRegistration {
    name: FILE_PROVIDER,
    create: &create
});

/// Provider storing the state of each version as files on a local filesystem.
#[derive(Default)]
pub struct FileStateStoreProvider {
    state: Option<Arc<ProviderState>>,
}

/// State of an initialized provider, shared with the stores it creates.
struct ProviderState {
    id: StoreIdentity,
    schema: StateSchema,
    files: StoreFiles,
    min_deltas_for_snapshot: usize,
    min_versions_to_retain: usize,
    max_versions_in_memory: usize,
    /// The most recently used versions.
    loaded: RwLock<BTreeMap<i64, Arc<StateMap>>>,
}

impl FileStateStoreProvider {
    fn state(&self) -> error_stack::Result<&Arc<ProviderState>, Error> {
        self.state
            .as_ref()
            .ok_or_else(|| error_stack::report!(Error::ProviderNotInitialized))
    }
}

impl StateStoreProvider for FileStateStoreProvider {
    fn init(
        &mut self,
        id: StoreIdentity,
        schema: StateSchema,
        conf: &StateStoreConf,
        _backend_conf: &BackendConf,
    ) -> error_stack::Result<(), Error> {
        error_stack::ensure!(self.state.is_none(), Error::ProviderAlreadyInitialized);

        let files = StoreFiles::create(id.store_path())?;
        tracing::info!("Initialized file state store for {id} in {:?}", files.dir());
        self.state = Some(Arc::new(ProviderState {
            id,
            schema,
            files,
            min_deltas_for_snapshot: conf.min_deltas_for_snapshot,
            min_versions_to_retain: conf.min_versions_to_retain,
            max_versions_in_memory: conf.max_versions_in_memory,
            loaded: RwLock::new(BTreeMap::new()),
        }));
        Ok(())
    }

    fn id(&self) -> Option<&StoreIdentity> {
        self.state.as_ref().map(|state| &state.id)
    }

    fn get_store(&self, version: i64) -> error_stack::Result<Box<dyn StateStore>, Error> {
        let state = self.state()?;
        error_stack::ensure!(version >= 0, Error::InvalidVersion(version));

        let base = state.load(version)?;
        Ok(Box::new(FileStateStore::new(state.clone(), version, base)))
    }

    fn do_maintenance(&self) -> error_stack::Result<(), Error> {
        let state = self.state()?;
        state.snapshot_if_needed()?;
        state.delete_old_files()
    }

    fn close(&self) -> error_stack::Result<(), Error> {
        if let Some(state) = &self.state {
            state.loaded.write().clear();
        }
        Ok(())
    }
}

impl ProviderState {
    /// Materialize the state at the given version.
    fn load(&self, version: i64) -> error_stack::Result<Arc<StateMap>, Error> {
        let cached = self
            .loaded
            .read()
            .range(..=version)
            .next_back()
            .map(|(version, state)| (*version, state.clone()));
        if let Some((cached_version, state)) = &cached {
            if *cached_version == version {
                return Ok(state.clone());
            }
        }

        let files = self.files.list()?;
        let snapshot = files
            .iter()
            .rev()
            .find(|file| file.kind == FileKind::Snapshot && file.version <= version)
            .map(|file| file.version);

        // Start from the most recent of the cached version and the snapshot.
        let (mut current, mut state) = match (cached, snapshot) {
            (Some((cached_version, _)), Some(snapshot)) if snapshot > cached_version => {
                (snapshot, self.files.read_snapshot(snapshot)?)
            }
            (Some((cached_version, cached)), _) => (cached_version, StateMap::clone(&cached)),
            (None, Some(snapshot)) => (snapshot, self.files.read_snapshot(snapshot)?),
            // Only a store without history, or one still holding the first
            // delta, can start from the empty initial version.
            (None, None) if !files.is_empty() && !files.contains(&StoreFile::delta(1)) => {
                error_stack::bail!(Error::VersionNotFound {
                    id: self.id.clone(),
                    version,
                })
            }
            (None, None) => (0, StateMap::new()),
        };

        while current < version {
            current += 1;
            if !self.files.exists(StoreFile::delta(current)) {
                error_stack::bail!(Error::VersionNotFound {
                    id: self.id.clone(),
                    version,
                });
            }

            for (key, value) in self.files.read_delta(current)? {
                match value {
                    Some(value) => state.insert(key, value),
                    None => state.remove(&key),
                };
            }
        }

        let state = Arc::new(state);
        self.cache(version, state.clone());
        Ok(state)
    }

    /// Remember a materialized version, evicting the oldest versions.
    fn cache(&self, version: i64, state: Arc<StateMap>) {
        let mut loaded = self.loaded.write();
        loaded.insert(version, state);
        while loaded.len() > self.max_versions_in_memory {
            loaded.pop_first();
        }
    }

    /// Drop a cached version, so the next load reads it from the files.
    fn forget(&self, version: i64) {
        self.loaded.write().remove(&version);
    }

    fn loaded_versions(&self) -> usize {
        self.loaded.read().len()
    }

    /// Write a snapshot of the latest version if enough deltas accumulated.
    fn snapshot_if_needed(&self) -> error_stack::Result<(), Error> {
        let files = self.files.list()?;
        let Some(latest) = files.iter().map(|file| file.version).max() else {
            return Ok(());
        };
        let last_snapshot = files
            .iter()
            .filter(|file| file.kind == FileKind::Snapshot)
            .map(|file| file.version)
            .max();
        if last_snapshot == Some(latest) {
            return Ok(());
        }

        let deltas = files
            .iter()
            .filter(|file| file.kind == FileKind::Delta)
            .filter(|file| last_snapshot.map_or(true, |snapshot| file.version > snapshot))
            .count();
        if deltas < self.min_deltas_for_snapshot {
            return Ok(());
        }

        let state = self.load(latest)?;
        self.files.write_snapshot(latest, &state)?;
        tracing::info!(
            "Wrote snapshot of version {latest} of {} after {deltas} deltas",
            self.id
        );
        Ok(())
    }

    /// Delete the files not needed to recover the retained versions.
    ///
    /// Every version from the latest back to `min_versions_to_retain` before
    /// it must remain loadable. Those are reconstructed from the newest
    /// snapshot at or before the earliest retained version, so only files
    /// older than that snapshot may be deleted.
    fn delete_old_files(&self) -> error_stack::Result<(), Error> {
        let files = self.files.list()?;
        let Some(latest) = files.iter().map(|file| file.version).max() else {
            return Ok(());
        };

        let retained = self.min_versions_to_retain.max(1) as i64;
        let earliest = latest.saturating_sub(retained - 1).max(0);
        let Some(base) = files
            .iter()
            .rev()
            .find(|file| file.kind == FileKind::Snapshot && file.version <= earliest)
            .map(|file| file.version)
        else {
            return Ok(());
        };

        let mut deleted = 0;
        for file in files {
            let obsolete = match file.kind {
                FileKind::Delta => file.version <= base,
                FileKind::Snapshot => file.version < base,
            };
            if obsolete {
                self.files.delete(file)?;
                deleted += 1;
            }
        }

        if deleted > 0 {
            tracing::info!(
                "Deleted {deleted} files of {} older than snapshot {base}",
                self.id
            );
        }
        Ok(())
    }
}
