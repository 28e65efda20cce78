//! tsdb-reader - the storage boundary of a time series query engine
//!
//! This crate provides push-down read descriptors, the reader contract a
//! storage backend implements, and a scheduler that walks a time range in
//! fixed windows issuing one storage read per window.

pub mod config;
pub mod lookup;
pub mod metrics;
pub mod query;
pub mod storage;
