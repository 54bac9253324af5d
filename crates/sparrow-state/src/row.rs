use arrow_schema::{DataType, Schema};
use decorum::Total;

/// A single value within a [Row].
#[derive(
    Clone, Debug, PartialEq, PartialOrd, Eq, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Datum {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    UInt64(u64),
    // Decorum is needed to provide a total ordering on `f64` so we can
    // derive `Ord` and `Hash`.
    Float64(Total<f64>),
    Utf8(String),
    Binary(Vec<u8>),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Returns true if this datum may be stored in a column of the given type.
    ///
    /// Nullability is checked separately, against the field.
    pub fn matches_type(&self, data_type: &DataType) -> bool {
        match self {
            Datum::Null => true,
            Datum::Boolean(_) => matches!(data_type, DataType::Boolean),
            Datum::Int32(_) => matches!(data_type, DataType::Int32),
            Datum::Int64(_) => matches!(data_type, DataType::Int64),
            Datum::UInt64(_) => matches!(data_type, DataType::UInt64),
            Datum::Float64(_) => matches!(data_type, DataType::Float64),
            Datum::Utf8(_) => matches!(data_type, DataType::Utf8 | DataType::LargeUtf8),
            Datum::Binary(_) => matches!(data_type, DataType::Binary | DataType::LargeBinary),
        }
    }

    fn estimated_size(&self) -> usize {
        let heap = match self {
            Datum::Utf8(s) => s.len(),
            Datum::Binary(b) => b.len(),
            _ => 0,
        };
        std::mem::size_of::<Datum>() + heap
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Boolean(b)
    }
}

impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Int32(n)
    }
}

impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Int64(n)
    }
}

impl From<u64> for Datum {
    fn from(n: u64) -> Self {
        Datum::UInt64(n)
    }
}

impl From<f64> for Datum {
    fn from(n: f64) -> Self {
        Datum::Float64(Total::from(n))
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::Utf8(s.to_owned())
    }
}

impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::Utf8(s)
    }
}

impl<T: Into<Datum>> From<Option<T>> for Datum {
    fn from(value: Option<T>) -> Self {
        value.map_or(Datum::Null, Into::into)
    }
}

/// A key or value stored in a state store.
///
/// Rows are ordered sequences of datums, described by the key or value
/// schema of the store. Rows are compared and hashed by value.
#[derive(Clone, Debug, Default, PartialEq, PartialOrd, Eq, Ord, Hash)]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct Row(Vec<Datum>);

/// Creates a [Row] from values convertible to [Datum].
///
/// ```ignore
/// let key = row!["user-1", 5i64];
/// ```
#[macro_export]
macro_rules! row {
    ($($value:expr),* $(,)?) => {
        $crate::Row::new(vec![$($crate::Datum::from($value)),*])
    };
}

impl Row {
    pub fn new(values: Vec<Datum>) -> Self {
        Row(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Datum> {
        self.0.get(index)
    }

    pub fn values(&self) -> &[Datum] {
        &self.0
    }

    /// Approximate number of bytes used by this row.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Row>() + self.0.iter().map(Datum::estimated_size).sum::<usize>()
    }

    /// Check that this row conforms to the given schema.
    ///
    /// Returns a description of the first mismatch, if any.
    pub fn check_schema(&self, schema: &Schema) -> Result<(), String> {
        let fields = schema.fields();
        if fields.len() != self.0.len() {
            return Err(format!(
                "expected {} columns but row had {}",
                fields.len(),
                self.0.len()
            ));
        }

        for (field, datum) in fields.iter().zip(self.0.iter()) {
            if datum.is_null() && !field.is_nullable() {
                return Err(format!("null value for non-nullable column '{}'", field.name()));
            }
            if !datum.matches_type(field.data_type()) {
                return Err(format!(
                    "value {datum:?} does not match type {} of column '{}'",
                    field.data_type(),
                    field.name()
                ));
            }
        }
        Ok(())
    }
}

impl From<Vec<Datum>> for Row {
    fn from(values: Vec<Datum>) -> Self {
        Row(values)
    }
}

impl FromIterator<Datum> for Row {
    fn from_iter<T: IntoIterator<Item = Datum>>(iter: T) -> Self {
        Row(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use arrow_schema::Field;

    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("count", DataType::Int64, true),
        ])
    }

    #[test]
    fn test_check_schema() {
        let schema = schema();
        assert_eq!(row!["a", 5i64].check_schema(&schema), Ok(()));
        assert_eq!(row!["a", None::<i64>].check_schema(&schema), Ok(()));

        let err = row!["a"].check_schema(&schema).unwrap_err();
        assert_eq!(err, "expected 2 columns but row had 1");

        let err = row![None::<&str>, 5i64].check_schema(&schema).unwrap_err();
        assert_eq!(err, "null value for non-nullable column 'key'");

        let err = row!["a", 5i32].check_schema(&schema).unwrap_err();
        assert_eq!(
            err,
            "value Int32(5) does not match type Int64 of column 'count'"
        );
    }

    #[test]
    fn test_float_rows_hash_and_order() {
        let mut set = hashbrown::HashSet::new();
        set.insert(row![1.5f64]);
        assert!(set.contains(&row![1.5f64]));
        assert!(row![1.5f64] < row![2.5f64]);
        assert!(row![None::<f64>] < row![f64::NEG_INFINITY]);
    }
}
