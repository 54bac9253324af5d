use std::ops::Bound;
use std::sync::Arc;

use error_stack::ResultExt;

use super::files::StateMap;
use super::ProviderState;
use crate::{
    range_scan, Error, Row, RowPairs, StateStore, StateStoreMetrics, StoreDelta, StoreIdentity,
    StoreStatus,
};

/// A transaction against one version of a file-backed store.
pub(super) struct FileStateStore {
    state: Arc<ProviderState>,
    version: i64,
    base: Arc<StateMap>,
    delta: StoreDelta,
    status: StoreStatus,
}

impl FileStateStore {
    pub fn new(state: Arc<ProviderState>, version: i64, base: Arc<StateMap>) -> Self {
        Self {
            state,
            version,
            base,
            delta: StoreDelta::default(),
            status: StoreStatus::Updating,
        }
    }

    fn try_commit(&self, version: i64) -> error_stack::Result<Arc<StateMap>, Error> {
        if !self.state.files.write_delta(version, &self.delta)? {
            // The existing delta is the committed version, not this one.
            tracing::info!(
                "Delta for version {version} of {} was already committed",
                self.state.id
            );
            self.state.forget(version);
            return self.state.load(version);
        }

        let mut committed = StateMap::clone(&self.base);
        for (key, value) in self.delta.changes() {
            match value {
                Some(value) => committed.insert(key.clone(), value.clone()),
                None => committed.remove(key),
            };
        }
        Ok(Arc::new(committed))
    }
}

impl StateStore for FileStateStore {
    fn id(&self) -> &StoreIdentity {
        &self.state.id
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn get(&self, key: &Row) -> error_stack::Result<Option<Row>, Error> {
        self.state.schema.validate_key(key)?;
        let value = match self.delta.get(key) {
            Some(value) => value,
            None => self.base.get(key),
        };
        Ok(value.cloned())
    }

    fn put(&mut self, key: &Row, value: &Row) -> error_stack::Result<(), Error> {
        self.status.ensure_updating("put")?;
        self.state.schema.validate_key(key)?;
        self.state.schema.validate_value(value)?;
        self.delta.put(key.clone(), value.clone());
        Ok(())
    }

    fn remove(&mut self, key: &Row) -> error_stack::Result<(), Error> {
        self.status.ensure_updating("remove")?;
        self.state.schema.validate_key(key)?;
        self.delta.remove(key.clone());
        Ok(())
    }

    fn get_range(
        &self,
        start: Option<&Row>,
        end: Option<&Row>,
    ) -> error_stack::Result<RowPairs, Error> {
        Ok(range_scan(&self.state.schema, self.iter()?, start, end))
    }

    fn iter(&self) -> error_stack::Result<RowPairs, Error> {
        let base = BaseRows {
            map: self.base.clone(),
            last: None,
        };
        Ok(self.delta.merge_over(base))
    }

    fn commit(&mut self) -> error_stack::Result<i64, Error> {
        self.status.ensure_updating("commit")?;

        let version = self.version + 1;
        match self.try_commit(version) {
            Ok(committed) => {
                self.state.cache(version, committed);
                self.status = StoreStatus::Committed;
                tracing::debug!(
                    "Committed version {version} of {} with {} changes",
                    self.state.id,
                    self.delta.changes().count()
                );
                Ok(version)
            }
            Err(e) => {
                // The delta may have been partially persisted, so the store
                // can't be committed again.
                self.status = StoreStatus::Aborted;
                Err(e).change_context_lazy(|| Error::Commit {
                    id: self.state.id.clone(),
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
        self.status = StoreStatus::Aborted;
        tracing::debug!("Aborted update of version {} of {}", self.version, self.state.id);
        Ok(())
    }

    fn num_keys(&self) -> usize {
        let mut num_keys = self.base.len();
        for (key, value) in self.delta.changes() {
            match (self.base.contains_key(key), value.is_some()) {
                (false, true) => num_keys += 1,
                (true, false) => num_keys -= 1,
                _ => (),
            }
        }
        num_keys
    }

    fn has_committed(&self) -> bool {
        self.status == StoreStatus::Committed
    }

    fn metrics(&self) -> StateStoreMetrics {
        let base_bytes: usize = self
            .base
            .iter()
            .map(|(key, value)| key.estimated_size() + value.estimated_size())
            .sum();
        let delta_bytes: usize = self
            .delta
            .changes()
            .map(|(key, value)| key.estimated_size() + value.map_or(0, Row::estimated_size))
            .sum();

        StateStoreMetrics {
            num_keys: self.num_keys(),
            memory_used_bytes: base_bytes + delta_bytes,
            custom_metrics: vec![("loaded_versions", self.state.loaded_versions() as u64)],
        }
    }
}

/// Owned iterator over the pairs of a shared state map.
struct BaseRows {
    map: Arc<StateMap>,
    /// The last key produced, used to resume the scan.
    last: Option<Row>,
}

impl Iterator for BaseRows {
    type Item = (Row, Row);

    fn next(&mut self) -> Option<Self::Item> {
        let mut remaining = match self.last.take() {
            Some(last) => self.map.range((Bound::Excluded(last), Bound::Unbounded)),
            None => self.map.range::<Row, _>(..),
        };
        let (key, value) = remaining.next()?;
        self.last = Some(key.clone());
        Some((key.clone(), value.clone()))
    }
}
