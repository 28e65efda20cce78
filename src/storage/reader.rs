//! The capability contract a storage backend implements.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::memory::Allocator;
use super::table::Table;
use crate::query::spec::{ReadFilterSpec, ReadGroupSpec, ReadSpec, ReadTagKeysSpec, ReadTagValuesSpec};
use crate::query::time::Time;

/// Error type for storage reads
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("Read rejected by storage backend: {0}")]
    Rejected(String),
    #[error("Read cancelled")]
    Cancelled,
    #[error("Memory limit exceeded: requested {requested} bytes with a limit of {limit} bytes")]
    MemoryLimitExceeded { requested: usize, limit: usize },
}

impl ReadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReadError::Cancelled)
    }

    /// Whether the caller may retry with a narrower scope
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, ReadError::MemoryLimitExceeded { .. })
    }
}

/// Result type for read operations
pub type ReadResult<T> = Result<T, ReadError>;

/// Cursor statistics reported by the storage engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorStats {
    pub scanned_values: u64,
    pub scanned_bytes: u64,
}

impl CursorStats {
    pub fn add(&mut self, other: CursorStats) {
        self.scanned_values = self.scanned_values.saturating_add(other.scanned_values);
        self.scanned_bytes = self.scanned_bytes.saturating_add(other.scanned_bytes);
    }
}

/// A lazy sequence of tables that also tracks cursor statistics
pub trait TableIterator: Iterator<Item = ReadResult<Table>> + Send {
    fn statistics(&self) -> CursorStats;
}

pub type BoxTableIterator = Box<dyn TableIterator>;

/// Storage backend.
///
/// Implementations must be safe for concurrent use by independent callers.
/// Bytes a read charges to `alloc` stay charged only while its tables are
/// buffered in the returned iterator.
#[async_trait]
pub trait Reader: Send + Sync {
    /// Reads unaggregated series matching the filter
    async fn read_filter(
        &self,
        cancel: &CancellationToken,
        spec: &ReadFilterSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator>;

    /// Reads series grouped, and optionally aggregated, per the group mode
    async fn read_group(
        &self,
        cancel: &CancellationToken,
        spec: &ReadGroupSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator>;

    async fn read_tag_keys(
        &self,
        cancel: &CancellationToken,
        spec: &ReadTagKeysSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator>;

    async fn read_tag_values(
        &self,
        cancel: &CancellationToken,
        spec: &ReadTagValuesSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator>;

    /// Legacy read over the window `[start, stop)`
    async fn read(
        &self,
        cancel: &CancellationToken,
        spec: &ReadSpec,
        start: Time,
        stop: Time,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator>;

    /// Releases backend resources. Idempotent.
    async fn close(&self);
}

/// Tables materialised up front, with fixed statistics
#[derive(Debug, Default)]
pub struct TableBuffer {
    tables: std::vec::IntoIter<Table>,
    stats: CursorStats,
    charge: Option<Charge>,
}

/// Bytes held in an allocator for the tables not yet yielded.
///
/// Whatever is still held is returned when the charge is dropped.
#[derive(Debug)]
struct Charge {
    alloc: Arc<Allocator>,
    sizes: VecDeque<usize>,
}

impl Drop for Charge {
    fn drop(&mut self) {
        let held: usize = self.sizes.iter().sum();
        if held > 0 {
            self.alloc.free(held);
        }
    }
}

impl TableBuffer {
    pub fn new(tables: Vec<Table>, stats: CursorStats) -> Self {
        Self {
            tables: tables.into_iter(),
            stats,
            charge: None,
        }
    }

    /// Buffers `tables`, charging each one's size to `alloc`.
    ///
    /// A table's bytes are freed when it is yielded, or when the buffer is
    /// dropped. If any table does not fit, the ones charged before it are
    /// freed and the error is returned.
    pub fn charged(tables: Vec<Table>, stats: CursorStats, alloc: &Arc<Allocator>) -> ReadResult<Self> {
        let mut charge = Charge {
            alloc: Arc::clone(alloc),
            sizes: VecDeque::with_capacity(tables.len()),
        };
        for table in &tables {
            let bytes = table.size_bytes();
            charge.alloc.allocate(bytes)?;
            charge.sizes.push_back(bytes);
        }
        Ok(Self {
            tables: tables.into_iter(),
            stats,
            charge: Some(charge),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn boxed(self) -> BoxTableIterator {
        Box::new(self)
    }
}

impl Iterator for TableBuffer {
    type Item = ReadResult<Table>;

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.tables.next()?;
        if let Some(charge) = &mut self.charge {
            if let Some(bytes) = charge.sizes.pop_front() {
                charge.alloc.free(bytes);
            }
        }
        Some(Ok(table))
    }
}

impl TableIterator for TableBuffer {
    fn statistics(&self) -> CursorStats {
        self.stats
    }
}
