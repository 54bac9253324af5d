use std::sync::{Arc, Weak};

use error_stack::ResultExt;
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::maintenance::MaintenanceTask;
use crate::{
    BackendConf, ClusterContext, Error, ProviderFactories, StateSchema, StateStore,
    StateStoreConf, StateStoreCoordinator, StateStoreProvider, StoreIdentity,
};

/// Loads, caches and maintains the providers of state stores.
///
/// At most one provider is loaded per [StoreIdentity]. When created with a
/// [ClusterContext] the registry reports each loaded store to the
/// coordinator and periodically runs maintenance on the providers it is
/// still the active server of. Providers of stores which moved to another
/// executor are unloaded.
///
/// Dropping the registry stops it.
pub struct StateStoreRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    cluster: Option<ClusterContext>,
    factories: ProviderFactories,
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    loaded: HashMap<StoreIdentity, Arc<dyn StateStoreProvider>>,
    maintenance: Option<MaintenanceTask>,
    /// Incremented each time a maintenance task is started.
    ///
    /// Used to ignore failures reported by tasks which were replaced.
    maintenance_epoch: u64,
    coordinator: Option<Arc<dyn StateStoreCoordinator>>,
}

impl std::fmt::Debug for StateStoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStoreRegistry")
            .field("cluster", &self.inner.cluster)
            .field("factories", &self.inner.factories)
            .finish_non_exhaustive()
    }
}

impl StateStoreRegistry {
    /// Create a registry using the providers registered with the inventory.
    pub fn new(cluster: Option<ClusterContext>) -> Self {
        Self::with_factories(cluster, ProviderFactories::registered())
    }

    /// Create a registry using a specific table of providers.
    pub fn with_factories(cluster: Option<ClusterContext>, factories: ProviderFactories) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                factories,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }

    /// Open the store of the given identity against the given version.
    ///
    /// Loads (and initializes) the provider for the identity if it isn't
    /// already loaded, using the provider named in `conf`. An already loaded
    /// provider is reused, regardless of the configuration.
    pub fn get(
        &self,
        id: &StoreIdentity,
        schema: &StateSchema,
        version: i64,
        conf: &StateStoreConf,
        backend_conf: &BackendConf,
    ) -> error_stack::Result<Box<dyn StateStore>, Error> {
        error_stack::ensure!(version >= 0, Error::InvalidVersion(version));

        let provider = {
            let mut state = self.inner.state.lock();
            self.inner.start_maintenance_if_needed(&mut state, conf);

            let provider = match state.loaded.get(id) {
                Some(provider) => provider.clone(),
                None => {
                    let mut provider = self.inner.factories.create(&conf.provider)?;
                    provider.init(id.clone(), schema.clone(), conf, backend_conf)?;
                    let provider: Arc<dyn StateStoreProvider> = Arc::from(provider);
                    tracing::info!("Loaded '{}' provider for {id}", conf.provider);
                    state.loaded.insert(id.clone(), provider.clone());
                    provider
                }
            };

            self.inner.report_active_instance(&mut state, id);
            provider
        };

        provider.get_store(version)
    }

    /// Unload and close the provider of the given identity, if it is loaded.
    pub fn unload(&self, id: &StoreIdentity) {
        let removed = self.inner.state.lock().loaded.remove(id);
        if let Some(provider) = removed {
            close(id, provider.as_ref());
        }
    }

    pub fn is_loaded(&self, id: &StoreIdentity) -> bool {
        self.inner.state.lock().loaded.contains_key(id)
    }

    /// The identities of the currently loaded providers.
    pub fn loaded_identities(&self) -> Vec<StoreIdentity> {
        self.inner.state.lock().loaded.keys().cloned().collect()
    }

    /// Whether the background maintenance task is running.
    pub fn is_maintenance_running(&self) -> bool {
        self.inner
            .state
            .lock()
            .maintenance
            .as_ref()
            .map_or(false, MaintenanceTask::is_running)
    }

    /// Run a single maintenance pass over the loaded providers.
    ///
    /// Providers this executor is still the active instance for are
    /// maintained. All others are unloaded.
    pub fn do_maintenance(&self) -> error_stack::Result<(), Error> {
        self.inner.do_maintenance()
    }

    /// Unload all providers and stop the maintenance task.
    ///
    /// Does not wait for an in-progress maintenance pass to complete.
    pub fn stop(&self) {
        let (unloaded, maintenance) = {
            let mut state = self.inner.state.lock();
            state.coordinator = None;
            (
                std::mem::take(&mut state.loaded),
                state.maintenance.take(),
            )
        };

        if let Some(maintenance) = maintenance {
            maintenance.stop();
        }

        for (id, provider) in unloaded {
            close(&id, provider.as_ref());
        }
        tracing::info!("Stopped state store registry");
    }
}

impl Drop for StateStoreRegistry {
    fn drop(&mut self) {
        self.stop()
    }
}

impl Inner {
    fn start_maintenance_if_needed(
        self: &Arc<Self>,
        state: &mut RegistryState,
        conf: &StateStoreConf,
    ) {
        if self.cluster.is_none()
            || state
                .maintenance
                .as_ref()
                .map_or(false, MaintenanceTask::is_running)
        {
            return;
        }

        state.maintenance_epoch += 1;
        let epoch = state.maintenance_epoch;

        let task_registry = Arc::downgrade(self);
        let error_registry = Arc::downgrade(self);
        match MaintenanceTask::start(
            conf.maintenance_interval,
            move || match task_registry.upgrade() {
                Some(inner) => inner.do_maintenance(),
                None => Ok(()),
            },
            move || on_maintenance_error(&error_registry, epoch),
        ) {
            Ok(task) => state.maintenance = Some(task),
            Err(e) => tracing::error!("Unable to start state store maintenance: {e:?}"),
        }
    }

    fn do_maintenance(&self) -> error_stack::Result<(), Error> {
        let loaded: Vec<_> = self
            .state
            .lock()
            .loaded
            .iter()
            .map(|(id, provider)| (id.clone(), provider.clone()))
            .collect();

        for (id, provider) in loaded {
            if self.verify_if_instance_active(&id) {
                provider
                    .do_maintenance()
                    .change_context_lazy(|| Error::Maintenance(id.clone()))?;
            } else {
                tracing::info!("Unloading {id}: no longer the active instance");
                self.unload_if_current(&id, &provider);
            }
        }
        Ok(())
    }

    /// Unload the provider only if it is still the one loaded for the identity.
    ///
    /// A concurrent `get` may have replaced the provider since it was
    /// snapshotted for maintenance.
    fn unload_if_current(&self, id: &StoreIdentity, provider: &Arc<dyn StateStoreProvider>) {
        let removed = {
            let mut state = self.state.lock();
            match state.loaded.get(id) {
                Some(loaded) if Arc::ptr_eq(loaded, provider) => state.loaded.remove(id),
                _ => None,
            }
        };

        if let Some(provider) = removed {
            close(id, provider.as_ref());
        }
    }

    /// Return the coordinator, connecting if necessary.
    ///
    /// Returns `None` without a cluster context, or if the connection fails.
    fn coordinator(&self, state: &mut RegistryState) -> Option<Arc<dyn StateStoreCoordinator>> {
        let cluster = self.cluster.as_ref()?;
        if let Some(coordinator) = &state.coordinator {
            return Some(coordinator.clone());
        }

        match cluster.connect() {
            Ok(coordinator) => {
                state.coordinator = Some(coordinator.clone());
                Some(coordinator)
            }
            Err(e) => {
                tracing::warn!("Unable to connect to state store coordinator: {e:?}");
                None
            }
        }
    }

    fn report_active_instance(&self, state: &mut RegistryState, id: &StoreIdentity) {
        let (Some(cluster), Some(coordinator)) = (&self.cluster, self.coordinator(state)) else {
            return;
        };
        coordinator.report_active_instance(id, cluster.host(), cluster.executor_id());
    }

    fn verify_if_instance_active(&self, id: &StoreIdentity) -> bool {
        let Some(cluster) = &self.cluster else {
            return false;
        };
        let Some(coordinator) = self.coordinator(&mut self.state.lock()) else {
            return false;
        };

        match coordinator.verify_if_instance_active(id, cluster.executor_id()) {
            Ok(active) => active,
            Err(e) => {
                tracing::warn!("Unable to verify {id} is active: {e:?}");
                false
            }
        }
    }
}

/// Handle the failure of the maintenance task started in `epoch`.
///
/// The loaded providers are forgotten without closing them, since open
/// stores may still be using them. Maintenance restarts on the next `get`.
fn on_maintenance_error(inner: &Weak<Inner>, epoch: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    let mut state = inner.state.lock();
    if state.maintenance_epoch != epoch {
        return;
    }
    tracing::warn!(
        "Clearing {} loaded providers after maintenance failure",
        state.loaded.len()
    );
    state.loaded.clear();
    state.maintenance.take();
}

fn close(id: &StoreIdentity, provider: &dyn StateStoreProvider) {
    match provider.close() {
        Ok(()) => tracing::info!("Unloaded provider for {id}"),
        Err(e) => tracing::warn!("Failed to close provider for {id}: {e:?}"),
    }
}
