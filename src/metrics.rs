//! Metrics for storage reads
//!
//! Counters and histograms are recorded through the `metrics` facade and can
//! be exposed in Prometheus format with [`init_metrics`].

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::storage::reader::CursorStats;

/// Initialize the metrics collection system
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    Ok(())
}

/// Record one completed window and the number of tables it produced
pub fn record_window(tables: usize) {
    counter!("tsdb_reader.source.windows").increment(1);
    histogram!("tsdb_reader.source.tables_per_window").record(tables as f64);
}

/// Record cursor statistics reported by the storage engine
pub fn record_cursor_stats(stats: CursorStats) {
    counter!("tsdb_reader.cursor.scanned_values").increment(stats.scanned_values);
    counter!("tsdb_reader.cursor.scanned_bytes").increment(stats.scanned_bytes);
}

/// Record a failed source run
pub fn record_source_error(kind: &'static str) {
    counter!("tsdb_reader.source.errors", "kind" => kind).increment(1);
}

/// Update memory usage metrics
pub fn update_memory_usage(bytes: u64) {
    gauge!("tsdb_reader.memory.allocated_bytes").set(bytes as f64);
}

/// Update the high-water mark of bytes held by reads
pub fn update_memory_high_water(bytes: u64) {
    gauge!("tsdb_reader.memory.max_allocated_bytes").set(bytes as f64);
}
