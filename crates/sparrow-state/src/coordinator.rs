use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::{Error, StoreIdentity};

/// Client of the cluster-wide authority tracking which executor serves each store.
///
/// The coordinator is the source of truth for which executor currently owns
/// a store. Reports are last-writer-wins, and verification must fail for any
/// executor other than the most recently reported one.
pub trait StateStoreCoordinator: Send + Sync {
    /// Report that the executor is serving the given store.
    ///
    /// This is advisory; failures should be logged rather than returned.
    fn report_active_instance(&self, id: &StoreIdentity, host: &str, executor_id: &str);

    /// Return true if the executor is still the active server of the store.
    fn verify_if_instance_active(
        &self,
        id: &StoreIdentity,
        executor_id: &str,
    ) -> error_stack::Result<bool, Error>;
}

/// Connects to the coordinator of the cluster.
pub trait CoordinatorConnector: Send + Sync {
    fn connect(&self) -> error_stack::Result<Arc<dyn StateStoreCoordinator>, Error>;
}

/// Information about the cluster the current process is executing in.
///
/// A registry created without a cluster context runs purely locally: it
/// never contacts a coordinator and never starts background maintenance.
#[derive(Clone)]
pub struct ClusterContext {
    host: String,
    executor_id: String,
    connector: Arc<dyn CoordinatorConnector>,
}

impl std::fmt::Debug for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterContext")
            .field("host", &self.host)
            .field("executor_id", &self.executor_id)
            .finish_non_exhaustive()
    }
}

impl ClusterContext {
    pub fn new(
        host: impl Into<String>,
        executor_id: impl Into<String>,
        connector: Arc<dyn CoordinatorConnector>,
    ) -> Self {
        Self {
            host: host.into(),
            executor_id: executor_id.into(),
            connector,
        }
    }

    /// Create a context using an already connected coordinator.
    pub fn with_coordinator(
        host: impl Into<String>,
        executor_id: impl Into<String>,
        coordinator: Arc<dyn StateStoreCoordinator>,
    ) -> Self {
        Self::new(host, executor_id, Arc::new(Connected(coordinator)))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn connect(&self) -> error_stack::Result<Arc<dyn StateStoreCoordinator>, Error> {
        self.connector.connect()
    }
}

struct Connected(Arc<dyn StateStoreCoordinator>);

impl CoordinatorConnector for Connected {
    fn connect(&self) -> error_stack::Result<Arc<dyn StateStoreCoordinator>, Error> {
        Ok(self.0.clone())
    }
}

/// An executor serving a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorLocation {
    pub host: String,
    pub executor_id: String,
}

impl std::fmt::Display for ExecutorLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "executor_{}_{}", self.host, self.executor_id)
    }
}

/// A coordinator tracking active instances within the current process.
///
/// Used when all executors share a process (such as local execution and
/// tests), and as the bookkeeping behind a remote coordinator service.
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    instances: Mutex<HashMap<StoreIdentity, ExecutorLocation>>,
}

impl LocalCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The executor most recently reported as serving the store.
    pub fn get_location(&self, id: &StoreIdentity) -> Option<ExecutorLocation> {
        self.instances.lock().get(id).cloned()
    }

    /// Forget all instances of stores within the given checkpoint location.
    ///
    /// Called when a query stops, so a restarted query doesn't consider the
    /// executors of the previous run active.
    pub fn deactivate_instances(&self, checkpoint_location: &str) {
        let mut instances = self.instances.lock();
        let before = instances.len();
        instances.retain(|id, _| id.checkpoint_location != checkpoint_location);
        tracing::debug!(
            "Deactivated {} instances for checkpoint '{checkpoint_location}'",
            before - instances.len()
        );
    }
}

impl StateStoreCoordinator for LocalCoordinator {
    fn report_active_instance(&self, id: &StoreIdentity, host: &str, executor_id: &str) {
        tracing::debug!("Reported {id} active on executor {executor_id} ({host})");
        self.instances.lock().insert(
            id.clone(),
            ExecutorLocation {
                host: host.to_owned(),
                executor_id: executor_id.to_owned(),
            },
        );
    }

    fn verify_if_instance_active(
        &self,
        id: &StoreIdentity,
        executor_id: &str,
    ) -> error_stack::Result<bool, Error> {
        let active = self
            .instances
            .lock()
            .get(id)
            .map_or(false, |location| location.executor_id == executor_id);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_report_wins() {
        let coordinator = LocalCoordinator::new();
        let id = StoreIdentity::new("/checkpoint", 0, 1);

        assert!(!coordinator.verify_if_instance_active(&id, "exec-1").unwrap());

        coordinator.report_active_instance(&id, "host-1", "exec-1");
        assert!(coordinator.verify_if_instance_active(&id, "exec-1").unwrap());

        coordinator.report_active_instance(&id, "host-2", "exec-2");
        assert!(!coordinator.verify_if_instance_active(&id, "exec-1").unwrap());
        assert!(coordinator.verify_if_instance_active(&id, "exec-2").unwrap());
        assert_eq!(
            coordinator.get_location(&id).unwrap().to_string(),
            "executor_host-2_exec-2"
        );
    }

    #[test]
    fn test_deactivate_instances_of_one_checkpoint() {
        let coordinator = LocalCoordinator::new();
        let first = StoreIdentity::new("/query-a", 0, 0);
        let second = StoreIdentity::new("/query-b", 0, 0);
        coordinator.report_active_instance(&first, "host", "exec");
        coordinator.report_active_instance(&second, "host", "exec");

        coordinator.deactivate_instances("/query-a");

        assert_eq!(coordinator.get_location(&first), None);
        assert!(coordinator.verify_if_instance_active(&second, "exec").unwrap());
    }
}
