use std::collections::BTreeMap;

use crate::{Error, Row, StateSchema, StoreIdentity};

/// Iterator over owned key/value pairs of a state store.
///
/// Iterators own a snapshot of the store taken when the scan started, so
/// the store may be modified while the iterator is in use.
pub type RowPairs = Box<dyn Iterator<Item = (Row, Row)> + Send>;

/// A transaction against one version of the state of one operator partition.
///
/// A store is opened against a base version by [crate::StateStoreProvider::get_store].
/// Updates are buffered until either [StateStore::commit], which durably
/// persists them as the next version, or [StateStore::abort], which discards
/// them. Either call ends the transaction; later updates fail with
/// [Error::StoreClosed].
pub trait StateStore: Send {
    /// The identity of the state this store belongs to.
    fn id(&self) -> &StoreIdentity;

    /// The version this store was opened against.
    fn version(&self) -> i64;

    /// Return the current value of the key, including uncommitted updates.
    fn get(&self, key: &Row) -> error_stack::Result<Option<Row>, Error>;

    /// Insert or replace the value of the key.
    ///
    /// The store keeps its own copies of the key and value.
    fn put(&mut self, key: &Row, value: &Row) -> error_stack::Result<(), Error>;

    /// Remove the key, if it exists.
    fn remove(&mut self, key: &Row) -> error_stack::Result<(), Error>;

    /// Return the pairs whose range key lies within the inclusive bounds.
    ///
    /// If the schema has a range key the results are ordered by it.
    /// Otherwise this is a full, unordered scan and the bounds are ignored.
    fn get_range(
        &self,
        start: Option<&Row>,
        end: Option<&Row>,
    ) -> error_stack::Result<RowPairs, Error>;

    /// Return all pairs in the store, in no particular order.
    fn iter(&self) -> error_stack::Result<RowPairs, Error>;

    /// Persist the updates, returning the new version.
    fn commit(&mut self) -> error_stack::Result<i64, Error>;

    /// Discard the updates.
    ///
    /// Aborting an aborted store does nothing.
    fn abort(&mut self) -> error_stack::Result<(), Error>;

    /// Number of keys with a value, including uncommitted updates.
    fn num_keys(&self) -> usize;

    /// Whether the updates have been committed.
    fn has_committed(&self) -> bool;

    fn metrics(&self) -> StateStoreMetrics;
}

/// Metrics reported by a state store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateStoreMetrics {
    pub num_keys: usize,
    /// Estimate of the memory used by the materialized state.
    pub memory_used_bytes: usize,
    /// Metrics specific to the provider implementation.
    pub custom_metrics: Vec<(&'static str, u64)>,
}

/// Lifecycle of a [StateStore].
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StoreStatus {
    #[display(fmt = "updating")]
    Updating,
    #[display(fmt = "committed")]
    Committed,
    #[display(fmt = "aborted")]
    Aborted,
}

impl StoreStatus {
    /// Fail unless the store is still accepting updates.
    pub fn ensure_updating(self, method: &'static str) -> error_stack::Result<(), Error> {
        match self {
            StoreStatus::Updating => Ok(()),
            StoreStatus::Committed => error_stack::bail!(Error::StoreClosed {
                method,
                state: "committed"
            }),
            StoreStatus::Aborted => error_stack::bail!(Error::StoreClosed {
                method,
                state: "aborted"
            }),
        }
    }
}

/// Uncommitted updates against a base version.
///
/// A `None` value records the removal of the key.
#[derive(Debug, Clone, Default)]
pub struct StoreDelta {
    changes: BTreeMap<Row, Option<Row>>,
}

impl StoreDelta {
    /// Look up the key in the delta.
    ///
    /// Returns `None` if the delta doesn't contain the key, and `Some(None)`
    /// if the key was removed.
    pub fn get(&self, key: &Row) -> Option<Option<&Row>> {
        self.changes.get(key).map(Option::as_ref)
    }

    pub fn put(&mut self, key: Row, value: Row) {
        self.changes.insert(key, Some(value));
    }

    pub fn remove(&mut self, key: Row) {
        self.changes.insert(key, None);
    }

    pub fn changes(&self) -> impl Iterator<Item = (&Row, Option<&Row>)> + '_ {
        self.changes.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// Merge a snapshot of this delta over the pairs of the base version.
    pub fn merge_over<I>(&self, base: I) -> RowPairs
    where
        I: Iterator<Item = (Row, Row)> + Send + 'static,
    {
        Box::new(MergedRows {
            base: Some(base),
            delta: self.changes.clone(),
            added: None,
        })
    }
}

/// Iterator applying a delta to the pairs of a base version.
///
/// Base pairs are produced first, with updated values replacing and removed
/// keys skipping the base value. Keys added by the delta follow.
struct MergedRows<I> {
    base: Option<I>,
    delta: BTreeMap<Row, Option<Row>>,
    added: Option<std::collections::btree_map::IntoIter<Row, Option<Row>>>,
}

impl<I> Iterator for MergedRows<I>
where
    I: Iterator<Item = (Row, Row)>,
{
    type Item = (Row, Row);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(base) = self.base.as_mut() {
            for (key, value) in base.by_ref() {
                match self.delta.remove(&key) {
                    Some(Some(updated)) => return Some((key, updated)),
                    Some(None) => continue,
                    None => return Some((key, value)),
                }
            }
            self.base = None;
            self.added = Some(std::mem::take(&mut self.delta).into_iter());
        }

        let added = self.added.as_mut()?;
        added.find_map(|(key, value)| value.map(|value| (key, value)))
    }
}

/// Restrict a scan to the given bounds, ordered by the range key.
///
/// Ordering requires the matching pairs to be collected and sorted before
/// the first is produced. Like other scans, the result reflects the state
/// when the scan started. Without a range key the scan is returned unchanged
/// and remains lazy.
pub fn range_scan(
    schema: &StateSchema,
    pairs: RowPairs,
    start: Option<&Row>,
    end: Option<&Row>,
) -> RowPairs {
    let Some(ordinal) = schema.key_index_ordinal() else {
        return pairs;
    };

    let mut in_range: Vec<_> = pairs
        .filter(|(key, _)| schema.in_range(key, start, end))
        .collect();
    in_range.sort_by(|(a, _), (b, _)| a.get(ordinal).cmp(&b.get(ordinal)));
    Box::new(in_range.into_iter())
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;

    use super::*;
    use crate::row;

    #[test]
    fn test_merge_applies_updates_and_removals() {
        let base = vec![
            (row![1i64], row!["one"]),
            (row![2i64], row!["two"]),
            (row![3i64], row!["three"]),
        ];

        let mut delta = StoreDelta::default();
        delta.put(row![2i64], row!["TWO"]);
        delta.remove(row![3i64]);
        delta.put(row![4i64], row!["four"]);
        delta.remove(row![5i64]);

        let merged: HashMap<_, _> = delta.merge_over(base.into_iter()).collect();
        let expected: HashMap<_, _> = [
            (row![1i64], row!["one"]),
            (row![2i64], row!["TWO"]),
            (row![4i64], row!["four"]),
        ]
        .into_iter()
        .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn test_merge_is_a_snapshot_of_the_delta() {
        let mut delta = StoreDelta::default();
        delta.put(row![1i64], row!["one"]);

        let merged = delta.merge_over(std::iter::empty());
        delta.put(row![2i64], row!["two"]);

        assert_eq!(merged.collect::<Vec<_>>(), vec![(row![1i64], row!["one"])]);
    }

    #[test]
    fn test_closed_status_rejects_updates() {
        StoreStatus::Updating.ensure_updating("put").unwrap();

        let err = StoreStatus::Committed.ensure_updating("put").unwrap_err();
        assert_eq!(
            err.current_context().to_string(),
            "cannot put a state store which was already committed"
        );
        let err = StoreStatus::Aborted.ensure_updating("remove").unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::StoreClosed {
                method: "remove",
                state: "aborted"
            }
        ));
    }
}
