//! Memory budget shared by every table sequence of a query.

use std::sync::atomic::{AtomicUsize, Ordering};

use super::reader::ReadError;

/// Tracks bytes materialised by reads against an optional ceiling.
///
/// Shared between concurrent reads through an `Arc`. Bytes charged for a
/// buffered table are freed once the table is handed to the caller.
#[derive(Debug, Default)]
pub struct Allocator {
    limit: Option<usize>,
    allocated: AtomicUsize,
    max_allocated: AtomicUsize,
}

impl Allocator {
    /// Creates an allocator without a ceiling
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator that refuses to go beyond `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Charges `bytes` against the budget.
    ///
    /// Nothing is recorded when the ceiling would be exceeded.
    pub fn allocate(&self, bytes: usize) -> Result<(), ReadError> {
        let limit = self.limit.unwrap_or(usize::MAX);
        let previous = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|next| *next <= limit)
            })
            .map_err(|_| ReadError::MemoryLimitExceeded {
                requested: bytes,
                limit,
            })?;
        self.max_allocated
            .fetch_max(previous + bytes, Ordering::AcqRel);
        Ok(())
    }

    /// Returns `bytes` to the budget
    pub fn free(&self, bytes: usize) {
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    /// Bytes currently charged
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// High-water mark of charged bytes
    pub fn max_allocated(&self) -> usize {
        self.max_allocated.load(Ordering::Acquire)
    }
}
