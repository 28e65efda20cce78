//! Query module for tsdb-reader
//! Handles read descriptors and the windowed read scheduler.

pub mod group;
pub mod id;
pub mod predicate;
pub mod source;
pub mod spec;
pub mod time;

pub use group::{to_group_mode, EngineGroupMode, GroupMode};
pub use source::{Source, SourceError, SourceState, TableSink};
pub use spec::{ReadFilterSpec, ReadGroupSpec, ReadSpec, ReadTagKeysSpec, ReadTagValuesSpec};
