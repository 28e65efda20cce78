use std::collections::BTreeMap;
use std::mem::size_of;

use crate::query::time::Time;

/// Column data carried by a table
#[derive(Debug, Clone, PartialEq)]
enum Columns {
    /// Parallel time and value columns of series data
    Series { times: Vec<Time>, values: Vec<f64> },
    /// A single string column, produced by metadata reads
    Strings(Vec<String>),
}

/// One table of a read result, identified by its group key
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    key: BTreeMap<String, String>,
    columns: Columns,
}

impl Table {
    pub fn series(key: BTreeMap<String, String>, times: Vec<Time>, values: Vec<f64>) -> Self {
        debug_assert_eq!(times.len(), values.len());
        Self {
            key,
            columns: Columns::Series { times, values },
        }
    }

    pub fn strings(key: BTreeMap<String, String>, values: Vec<String>) -> Self {
        Self {
            key,
            columns: Columns::Strings(values),
        }
    }

    /// Returns the group key of the table
    pub fn key(&self) -> &BTreeMap<String, String> {
        &self.key
    }

    /// Returns the time column, empty for string tables
    pub fn times(&self) -> &[Time] {
        match &self.columns {
            Columns::Series { times, .. } => times,
            Columns::Strings(_) => &[],
        }
    }

    /// Returns the value column, empty for string tables
    pub fn values(&self) -> &[f64] {
        match &self.columns {
            Columns::Series { values, .. } => values,
            Columns::Strings(_) => &[],
        }
    }

    /// Returns the string column, empty for series tables
    pub fn strings_column(&self) -> &[String] {
        match &self.columns {
            Columns::Strings(values) => values,
            Columns::Series { .. } => &[],
        }
    }

    /// Number of rows in the table
    pub fn len(&self) -> usize {
        match &self.columns {
            Columns::Series { times, .. } => times.len(),
            Columns::Strings(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated memory footprint, charged against the read's allocator
    pub fn size_bytes(&self) -> usize {
        let key_bytes: usize = self.key.iter().map(|(k, v)| k.len() + v.len()).sum();
        let column_bytes = match &self.columns {
            Columns::Series { times, values } => {
                times.len() * size_of::<Time>() + values.len() * size_of::<f64>()
            }
            Columns::Strings(values) => values.iter().map(|s| s.len() + size_of::<String>()).sum(),
        };
        key_bytes + column_bytes
    }
}
