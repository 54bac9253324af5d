use arrow_schema::SchemaRef;

use crate::{Datum, Error, Row};

/// Describes the keys and values held in a state store.
///
/// Supplied once when the provider is initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSchema {
    key_schema: SchemaRef,
    value_schema: SchemaRef,
    /// Column of the key used for range scans, if any.
    key_index_ordinal: Option<usize>,
}

impl StateSchema {
    pub fn try_new(
        key_schema: SchemaRef,
        value_schema: SchemaRef,
        key_index_ordinal: Option<usize>,
    ) -> error_stack::Result<Self, Error> {
        if let Some(ordinal) = key_index_ordinal {
            let num_columns = key_schema.fields().len();
            if ordinal >= num_columns {
                return Err(error_stack::report!(Error::InvalidSchema).attach_printable(format!(
                    "key index ordinal {ordinal} out of range for {num_columns} key columns"
                )));
            }
        }

        Ok(Self {
            key_schema,
            value_schema,
            key_index_ordinal,
        })
    }

    pub fn key_schema(&self) -> &SchemaRef {
        &self.key_schema
    }

    pub fn value_schema(&self) -> &SchemaRef {
        &self.value_schema
    }

    pub fn key_index_ordinal(&self) -> Option<usize> {
        self.key_index_ordinal
    }

    /// Return the range-key column of the given key, if a range key is configured.
    pub fn range_key<'a>(&self, key: &'a Row) -> Option<&'a Datum> {
        self.key_index_ordinal.and_then(|ordinal| key.get(ordinal))
    }

    pub fn validate_key(&self, key: &Row) -> error_stack::Result<(), Error> {
        key.check_schema(&self.key_schema).map_err(|mismatch| {
            error_stack::report!(Error::InvalidKey).attach_printable(mismatch)
        })
    }

    pub fn validate_value(&self, value: &Row) -> error_stack::Result<(), Error> {
        value.check_schema(&self.value_schema).map_err(|mismatch| {
            error_stack::report!(Error::InvalidValue).attach_printable(mismatch)
        })
    }

    /// Returns true if the key falls within the (inclusive) bounds.
    ///
    /// Only the range-key column of the bounds is considered. Without a
    /// configured range key every key is in range.
    pub fn in_range(&self, key: &Row, start: Option<&Row>, end: Option<&Row>) -> bool {
        let Some(value) = self.range_key(key) else {
            return true;
        };
        let after_start = start
            .and_then(|start| self.range_key(start))
            .map_or(true, |start| value >= start);
        let before_end = end
            .and_then(|end| self.range_key(end))
            .map_or(true, |end| value <= end);
        after_start && before_end
    }
}
