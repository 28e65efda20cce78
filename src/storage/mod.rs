//! Storage module for tsdb-reader
//! Handles the reader contract, memory accounting and the in-memory backend.

pub mod mem;
pub mod memory;
pub mod reader;
pub mod table;

pub use memory::Allocator;
pub use reader::{BoxTableIterator, CursorStats, ReadError, Reader, TableIterator};
pub use table::Table;
