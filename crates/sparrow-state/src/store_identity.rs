use std::path::PathBuf;

/// Identifies the state of one partition of one stateful operator.
///
/// The checkpoint location identifies the query; within it, each operator
/// partition may own one or more named stores. Identities compare and hash
/// by value, and are used as the cache key of the [crate::StateStoreRegistry].
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
pub struct StoreIdentity {
    /// Checkpoint directory of the query owning this state.
    pub checkpoint_location: String,
    /// Operation ID in the execution plan for this state.
    pub operator_id: i64,
    /// Partition of the operation.
    pub partition_id: i32,
    /// Name of the store within the operator partition.
    ///
    /// Empty for the default store.
    pub name: String,
}

impl StoreIdentity {
    pub fn new(
        checkpoint_location: impl Into<String>,
        operator_id: i64,
        partition_id: i32,
    ) -> Self {
        Self {
            checkpoint_location: checkpoint_location.into(),
            operator_id,
            partition_id,
            name: String::new(),
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    /// The directory holding the files for this store.
    ///
    /// Laid out as `<checkpoint>/<operator>/<partition>`, with the store name
    /// appended for non-default stores.
    pub fn store_path(&self) -> PathBuf {
        let mut path = PathBuf::from(&self.checkpoint_location);
        path.push(self.operator_id.to_string());
        path.push(self.partition_id.to_string());
        if !self.name.is_empty() {
            path.push(&self.name);
        }
        path
    }
}

impl std::fmt::Display for StoreIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StoreIdentity(op={}, part={}, name='{}', checkpoint={})",
            self.operator_id, self.partition_id, self.name, self.checkpoint_location
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_path_omits_default_name() {
        let id = StoreIdentity::new("/tmp/query", 3, 7);
        assert_eq!(id.store_path(), PathBuf::from("/tmp/query/3/7"));

        let named = id.with_name("left-keys");
        assert_eq!(named.store_path(), PathBuf::from("/tmp/query/3/7/left-keys"));
    }

    #[test]
    fn test_identity_equality_is_by_value() {
        let a = StoreIdentity::new("/tmp/query", 1, 0);
        let b = StoreIdentity::new(String::from("/tmp/query"), 1, 0);
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_name("other"));

        let mut set = hashbrown::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
