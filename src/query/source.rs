//! Windowed read scheduler.
//!
//! A [`Source`] walks a time range in fixed-size, fixed-step windows, issues
//! one legacy storage read per window and feeds the resulting tables to its
//! sinks. Each window is `[cursor - period, cursor)`; after a window the
//! cursor moves by `every`.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::id::DatasetId;
use super::spec::ReadSpec;
use super::time::{Bounds, Time, Window};
use crate::metrics;
use crate::storage::memory::Allocator;
use crate::storage::reader::{BoxTableIterator, CursorStats, ReadError, Reader};
use crate::storage::table::Table;

/// Error type for source runs
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    #[error("Storage read failed: {0}")]
    Read(ReadError),
    #[error("Source cancelled")]
    Cancelled,
    #[error("Invalid window: {0}")]
    InvalidWindow(String),
    #[error("Sink failed: {0}")]
    Sink(String),
}

impl From<ReadError> for SourceError {
    fn from(err: ReadError) -> Self {
        match err {
            ReadError::Cancelled => SourceError::Cancelled,
            other => SourceError::Read(other),
        }
    }
}

impl SourceError {
    fn kind(&self) -> &'static str {
        match self {
            SourceError::Read(ReadError::MemoryLimitExceeded { .. }) => "memory_limit",
            SourceError::Read(_) => "read",
            SourceError::Cancelled => "cancelled",
            SourceError::InvalidWindow(_) => "invalid_window",
            SourceError::Sink(_) => "sink",
        }
    }
}

/// Result type for source operations
pub type SourceResult<T> = Result<T, SourceError>;

/// Lifecycle of a source. Every state but `Active` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// More windows may be produced
    Active,
    /// The next step would leave the representable time domain
    Overflowed,
    /// The next window would end past the overall bounds
    RangeExhausted,
    /// A read or a sink failed
    Failed,
    /// The run was cancelled by its caller
    Cancelled,
}

impl SourceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SourceState::Active)
    }
}

/// Downstream consumer of the tables a source produces
#[async_trait]
pub trait TableSink: Send {
    async fn process(&mut self, id: DatasetId, table: &Table) -> SourceResult<()>;

    /// Signals that no more data at or before `mark` will arrive
    async fn update_watermark(&mut self, id: DatasetId, mark: Time) -> SourceResult<()>;

    /// Called once when the run ends, with its error if it failed
    async fn finish(&mut self, id: DatasetId, err: Option<&SourceError>);
}

/// Performs windowed storage reads
pub struct Source {
    id: DatasetId,
    reader: Arc<dyn Reader>,
    read_spec: ReadSpec,
    window: Window,
    bounds: Bounds,
    alloc: Arc<Allocator>,
    sinks: Vec<Box<dyn TableSink>>,

    current_time: Time,
    overflow: bool,
    state: SourceState,
    stats: CursorStats,
}

impl Source {
    /// Creates a source whose first window ends at `current_time`.
    ///
    /// A zero `every` is rejected since the window would never move.
    pub fn new(
        id: DatasetId,
        reader: Arc<dyn Reader>,
        read_spec: ReadSpec,
        bounds: Bounds,
        window: Window,
        current_time: Time,
        alloc: Arc<Allocator>,
    ) -> SourceResult<Self> {
        if window.every == 0 {
            return Err(SourceError::InvalidWindow(
                "window step must not be zero".to_string(),
            ));
        }
        Ok(Self {
            id,
            reader,
            read_spec,
            window,
            bounds,
            alloc,
            sinks: Vec::new(),
            current_time,
            overflow: false,
            state: SourceState::Active,
            stats: CursorStats::default(),
        })
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    pub fn add_sink(&mut self, sink: Box<dyn TableSink>) {
        self.sinks.push(sink);
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Cursor statistics accumulated over every processed window
    pub fn stats(&self) -> CursorStats {
        self.stats
    }

    /// Runs the source to completion, feeding every sink.
    ///
    /// Every sink is finished with the outcome, which is also returned.
    pub async fn run(&mut self, cancel: &CancellationToken) -> SourceResult<()> {
        let predicate_keys = self
            .read_spec
            .predicate
            .as_ref()
            .map(|p| p.tag_keys().join(","))
            .unwrap_or_default();
        info!(
            "Starting windowed read: id={}, bounds={}, every={}ns, period={}ns, predicate_keys=[{}], memory_limit={:?}",
            self.id,
            self.bounds,
            self.window.every,
            self.window.period,
            predicate_keys,
            self.alloc.limit()
        );

        let result = self.drive(cancel).await;

        for sink in &mut self.sinks {
            sink.finish(self.id, result.as_ref().err()).await;
        }
        metrics::record_cursor_stats(self.stats);
        metrics::update_memory_usage(self.alloc.allocated() as u64);
        metrics::update_memory_high_water(self.alloc.max_allocated() as u64);

        match &result {
            Ok(()) => info!(
                "Windowed read finished: id={}, state={:?}, scanned_values={}",
                self.id, self.state, self.stats.scanned_values
            ),
            Err(SourceError::Cancelled) => warn!("Windowed read cancelled: id={}", self.id),
            Err(e) => {
                metrics::record_source_error(e.kind());
                error!("Windowed read failed: id={}, error={}", self.id, e);
            }
        }
        result
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> SourceResult<()> {
        while let Some((tables, mark)) = self.next(cancel).await? {
            if let Err(e) = self.process_tables(cancel, tables, mark).await {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    async fn process_tables(
        &mut self,
        cancel: &CancellationToken,
        mut tables: BoxTableIterator,
        mark: Time,
    ) -> SourceResult<()> {
        let mut count = 0;
        for table in tables.by_ref() {
            if cancel.is_cancelled() {
                return Err(SourceError::Cancelled);
            }
            let table = table?;
            for sink in &mut self.sinks {
                sink.process(self.id, &table).await?;
            }
            count += 1;
        }
        self.stats.add(tables.statistics());
        for sink in &mut self.sinks {
            sink.update_watermark(self.id, mark).await?;
        }
        metrics::record_window(count);
        Ok(())
    }

    /// Moves the source into its terminal failure state
    fn fail(&mut self, err: SourceError) -> SourceError {
        self.state = match err {
            SourceError::Cancelled => SourceState::Cancelled,
            _ => SourceState::Failed,
        };
        err
    }

    /// Reads the next window.
    ///
    /// Returns the window's tables with its watermark, `None` once the
    /// source is in a terminal state, or the error that made it fail.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> SourceResult<Option<(BoxTableIterator, Time)>> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        if cancel.is_cancelled() {
            return Err(self.fail(SourceError::Cancelled));
        }

        let start = self.current_time.saturating_sub(self.window.period);
        let stop = self.current_time;
        if stop > self.bounds.stop {
            self.state = SourceState::RangeExhausted;
            debug!("Window stop {} is past bounds stop {}", stop, self.bounds.stop);
            return Ok(None);
        }

        // Check if the step would overflow; if so this window is the last.
        let every = self.window.every;
        let cursor = self.current_time.nanos();
        self.overflow = if every > 0 {
            cursor > i64::MAX - every
        } else {
            cursor < i64::MIN - every
        };
        self.current_time = self.current_time.saturating_add(every);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ReadError::Cancelled),
            result = self.reader.read(cancel, &self.read_spec, start, stop, &self.alloc) => result,
        };

        match result {
            Ok(tables) => {
                debug!(
                    "Read window: id={}, start={}, stop={}",
                    self.id,
                    start.nanos(),
                    stop.nanos()
                );
                if self.overflow {
                    self.state = SourceState::Overflowed;
                }
                Ok(Some((tables, stop)))
            }
            Err(e) => Err(self.fail(e.into())),
        }
    }
}

/// Sink that logs every table and keeps running totals
#[derive(Debug, Default)]
pub struct LogSink {
    pub tables: usize,
    pub rows: usize,
    pub watermark: Option<Time>,
}

#[async_trait]
impl TableSink for LogSink {
    async fn process(&mut self, id: DatasetId, table: &Table) -> SourceResult<()> {
        self.tables += 1;
        self.rows += table.len();
        info!("Table: id={}, key={:?}, rows={}", id, table.key(), table.len());
        Ok(())
    }

    async fn update_watermark(&mut self, id: DatasetId, mark: Time) -> SourceResult<()> {
        debug!("Watermark: id={}, mark={}", id, mark);
        self.watermark = Some(mark);
        Ok(())
    }

    async fn finish(&mut self, id: DatasetId, err: Option<&SourceError>) {
        match err {
            Some(e) => warn!("Source {} finished with error: {}", id, e),
            None => info!(
                "Source {} finished: tables={}, rows={}",
                id, self.tables, self.rows
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tokio::sync::Mutex;

    use crate::query::id::Id;
    use crate::query::predicate::{Predicate, TagFilterOp};
    use crate::query::spec::{ReadFilterSpec, ReadGroupSpec, ReadTagKeysSpec, ReadTagValuesSpec};
    use crate::storage::mem::MemStore;
    use crate::storage::reader::{ReadResult, TableBuffer};

    /// Records every window it is asked for and fails on request
    #[derive(Default)]
    struct ScriptedReader {
        windows: std::sync::Mutex<Vec<(i64, i64)>>,
        fail_at: Option<usize>,
        hang: bool,
    }

    impl ScriptedReader {
        fn windows(&self) -> Vec<(i64, i64)> {
            self.windows.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Reader for ScriptedReader {
        async fn read_filter(&self, _: &CancellationToken, _: &ReadFilterSpec, _: &Arc<Allocator>) -> ReadResult<BoxTableIterator> {
            Ok(TableBuffer::empty().boxed())
        }

        async fn read_group(&self, _: &CancellationToken, _: &ReadGroupSpec, _: &Arc<Allocator>) -> ReadResult<BoxTableIterator> {
            Ok(TableBuffer::empty().boxed())
        }

        async fn read_tag_keys(&self, _: &CancellationToken, _: &ReadTagKeysSpec, _: &Arc<Allocator>) -> ReadResult<BoxTableIterator> {
            Ok(TableBuffer::empty().boxed())
        }

        async fn read_tag_values(&self, _: &CancellationToken, _: &ReadTagValuesSpec, _: &Arc<Allocator>) -> ReadResult<BoxTableIterator> {
            Ok(TableBuffer::empty().boxed())
        }

        async fn read(
            &self,
            _: &CancellationToken,
            _: &ReadSpec,
            start: Time,
            stop: Time,
            _: &Arc<Allocator>,
        ) -> ReadResult<BoxTableIterator> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let index = {
                let mut windows = self.windows.lock().unwrap();
                windows.push((start.nanos(), stop.nanos()));
                windows.len() - 1
            };
            if self.fail_at == Some(index) {
                return Err(ReadError::Unavailable("connection refused".to_string()));
            }
            let table = Table::series(BTreeMap::new(), vec![start], vec![index as f64]);
            let stats = CursorStats {
                scanned_values: 1,
                scanned_bytes: 16,
            };
            Ok(TableBuffer::new(vec![table], stats).boxed())
        }

        async fn close(&self) {}
    }

    /// Shares what it sees with the test through a mutex
    #[derive(Default, Clone)]
    struct RecordingSink {
        marks: Arc<Mutex<Vec<Time>>>,
        tables: Arc<Mutex<usize>>,
        finished: Arc<Mutex<Option<Option<SourceError>>>>,
    }

    #[async_trait]
    impl TableSink for RecordingSink {
        async fn process(&mut self, _: DatasetId, _: &Table) -> SourceResult<()> {
            *self.tables.lock().await += 1;
            Ok(())
        }

        async fn update_watermark(&mut self, _: DatasetId, mark: Time) -> SourceResult<()> {
            self.marks.lock().await.push(mark);
            Ok(())
        }

        async fn finish(&mut self, _: DatasetId, err: Option<&SourceError>) {
            *self.finished.lock().await = Some(err.cloned());
        }
    }

    fn read_spec() -> ReadSpec {
        ReadSpec::new(Id::new(1).unwrap(), Id::new(2).unwrap())
    }

    fn source(reader: Arc<dyn Reader>, bounds: Bounds, window: Window, current: i64) -> Source {
        Source::new(
            DatasetId::new(),
            reader,
            read_spec(),
            bounds,
            window,
            Time::from_nanos(current),
            Arc::new(Allocator::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_five_tumbling_windows() {
        let reader = Arc::new(ScriptedReader::default());
        let mut src = source(reader.clone(), Bounds::new(0, 100), Window::tumbling(20), 20);
        let sink = RecordingSink::default();
        src.add_sink(Box::new(sink.clone()));

        src.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(
            reader.windows(),
            vec![(0, 20), (20, 40), (40, 60), (60, 80), (80, 100)]
        );
        assert_eq!(src.state(), SourceState::RangeExhausted);
        assert_eq!(*sink.tables.lock().await, 5);
        assert_eq!(src.stats().scanned_values, 5);
        assert_eq!(*sink.finished.lock().await, Some(None));
    }

    #[tokio::test]
    async fn test_windows_cover_range_without_gaps() {
        for (period, every, first) in [(10, 10, 10), (7, 7, 7), (30, 10, 10), (5, 5, -15)] {
            let reader = Arc::new(ScriptedReader::default());
            let mut src = source(reader.clone(), Bounds::new(0, 100), Window::new(every, period), first);
            let sink = RecordingSink::default();
            src.add_sink(Box::new(sink.clone()));
            src.run(&CancellationToken::new()).await.unwrap();

            let windows = reader.windows();
            let marks = sink.marks.lock().await.clone();
            assert!(marks.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(windows.first().unwrap().0, first - period);
            for pair in windows.windows(2) {
                assert_eq!(pair[1].1 - pair[0].1, every);
                assert_eq!(pair[0].1 - pair[0].0, period);
            }
            let last_stop = windows.last().unwrap().1;
            assert!(last_stop <= 100 && last_stop + every > 100);
        }
    }

    #[tokio::test]
    async fn test_overflow_at_max_yields_one_window() {
        let reader = Arc::new(ScriptedReader::default());
        let current = i64::MAX - 5;
        let mut src = source(
            reader.clone(),
            Bounds::unbounded(),
            Window::tumbling(10),
            current,
        );
        let cancel = CancellationToken::new();

        let (_, mark) = src.next(&cancel).await.unwrap().unwrap();
        assert_eq!(mark.nanos(), current);
        assert_eq!(src.state(), SourceState::Overflowed);
        assert!(src.next(&cancel).await.unwrap().is_none());
        assert_eq!(reader.windows(), vec![(current - 10, current)]);
    }

    #[tokio::test]
    async fn test_overflow_at_min_with_negative_step() {
        let reader = Arc::new(ScriptedReader::default());
        let current = i64::MIN + 5;
        let mut src = source(
            reader.clone(),
            Bounds::unbounded(),
            Window::new(-10, 10),
            current,
        );

        src.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(src.state(), SourceState::Overflowed);
        // window start clamps instead of wrapping
        assert_eq!(reader.windows(), vec![(i64::MIN, current)]);
    }

    #[tokio::test]
    async fn test_no_overflow_just_inside_the_edge() {
        let reader = Arc::new(ScriptedReader::default());
        let current = i64::MAX - 20;
        let mut src = source(
            reader.clone(),
            Bounds::unbounded(),
            Window::tumbling(10),
            current,
        );

        src.run(&CancellationToken::new()).await.unwrap();

        // the window ending exactly at MAX is still produced
        assert_eq!(
            reader.windows(),
            vec![
                (current - 10, current),
                (current, current + 10),
                (current + 10, i64::MAX),
            ]
        );
        assert_eq!(src.state(), SourceState::Overflowed);
    }

    #[tokio::test]
    async fn test_backend_error_is_fail_stop() {
        let reader = Arc::new(ScriptedReader {
            fail_at: Some(2),
            ..Default::default()
        });
        let mut src = source(reader.clone(), Bounds::new(0, 100), Window::tumbling(20), 20);
        let sink = RecordingSink::default();
        src.add_sink(Box::new(sink.clone()));
        let cancel = CancellationToken::new();

        let err = src.run(&cancel).await.unwrap_err();

        assert!(matches!(err, SourceError::Read(ReadError::Unavailable(_))));
        assert_eq!(src.state(), SourceState::Failed);
        assert_eq!(reader.windows().len(), 3);
        assert_eq!(*sink.tables.lock().await, 2);
        assert_eq!(*sink.finished.lock().await, Some(Some(err)));
        assert!(src.next(&cancel).await.unwrap().is_none());
        assert_eq!(reader.windows().len(), 3);
    }

    #[tokio::test]
    async fn test_cancel_before_run() {
        let reader = Arc::new(ScriptedReader::default());
        let mut src = source(reader.clone(), Bounds::new(0, 100), Window::tumbling(20), 20);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = src.run(&cancel).await.unwrap_err();

        assert_eq!(err, SourceError::Cancelled);
        assert_eq!(src.state(), SourceState::Cancelled);
        assert!(reader.windows().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_read_pending() {
        let reader = Arc::new(ScriptedReader {
            hang: true,
            ..Default::default()
        });
        let mut src = source(reader, Bounds::new(0, 100), Window::tumbling(20), 20);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = src.run(&cancel).await.unwrap_err();
        assert_eq!(err, SourceError::Cancelled);
        assert_eq!(src.state(), SourceState::Cancelled);
    }

    #[test]
    fn test_zero_step_rejected() {
        let result = Source::new(
            DatasetId::new(),
            Arc::new(ScriptedReader::default()),
            read_spec(),
            Bounds::new(0, 100),
            Window::new(0, 10),
            Time::from_nanos(10),
            Arc::new(Allocator::new()),
        );
        assert!(matches!(result, Err(SourceError::InvalidWindow(_))));
    }

    #[tokio::test]
    async fn test_run_against_mem_store() {
        let store = Arc::new(MemStore::new());
        let (org, bucket) = (Id::new(1).unwrap(), Id::new(2).unwrap());
        for i in 0..10 {
            store
                .write(org, bucket, &[("host", "a")], Time::from_nanos(i * 10), i as f64)
                .await
                .unwrap();
        }
        let alloc = Arc::new(Allocator::with_limit(1 << 20));
        let mut src = Source::new(
            DatasetId::new(),
            store,
            ReadSpec::new(org, bucket).with_aggregate("count"),
            Bounds::new(0, 100),
            Window::tumbling(25),
            Time::from_nanos(25),
            alloc.clone(),
        )
        .unwrap();
        let sink = RecordingSink::default();
        src.add_sink(Box::new(sink.clone()));

        src.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(*sink.tables.lock().await, 4);
        assert_eq!(src.stats().scanned_values, 10);
        assert!(alloc.max_allocated() > 0);
        assert_eq!(alloc.allocated(), 0);
    }

    #[tokio::test]
    async fn test_budget_for_one_window_covers_a_long_run() {
        let store = Arc::new(MemStore::new());
        let (org, bucket) = (Id::new(1).unwrap(), Id::new(2).unwrap());
        for i in 0..10 {
            store
                .write(org, bucket, &[("host", "a")], Time::from_nanos(i * 10), i as f64)
                .await
                .unwrap();
        }
        // one window holds a 21-byte table; ten windows together would not fit
        let alloc = Arc::new(Allocator::with_limit(64));
        let mut src = Source::new(
            DatasetId::new(),
            store,
            ReadSpec::new(org, bucket)
                .with_predicate(Predicate::tag("host", TagFilterOp::Eq, "a")),
            Bounds::new(0, 100),
            Window::tumbling(10),
            Time::from_nanos(10),
            alloc.clone(),
        )
        .unwrap();
        let sink = RecordingSink::default();
        src.add_sink(Box::new(sink.clone()));

        src.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(src.state(), SourceState::RangeExhausted);
        assert_eq!(*sink.tables.lock().await, 10);
        assert_eq!(alloc.allocated(), 0);
        assert_eq!(alloc.max_allocated(), 21);
    }

    #[tokio::test]
    async fn test_memory_exhaustion_is_distinguishable() {
        let store = Arc::new(MemStore::new());
        let (org, bucket) = (Id::new(1).unwrap(), Id::new(2).unwrap());
        store
            .write(org, bucket, &[("host", "a")], Time::from_nanos(5), 1.0)
            .await
            .unwrap();
        let mut src = Source::new(
            DatasetId::new(),
            store,
            ReadSpec::new(org, bucket),
            Bounds::new(0, 100),
            Window::tumbling(50),
            Time::from_nanos(50),
            Arc::new(Allocator::with_limit(1)),
        )
        .unwrap();

        let err = src.run(&CancellationToken::new()).await.unwrap_err();
        match err {
            SourceError::Read(e) => assert!(e.is_resource_exhausted()),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_sink_totals() {
        let reader = Arc::new(ScriptedReader::default());
        let mut src = source(reader, Bounds::new(0, 40), Window::tumbling(20), 20);
        src.add_sink(Box::new(LogSink::default()));
        src.run(&CancellationToken::new()).await.unwrap();

        let mut sink = LogSink::default();
        let table = Table::series(BTreeMap::new(), vec![Time::from_nanos(1)], vec![1.0]);
        sink.process(src.id(), &table).await.unwrap();
        sink.update_watermark(src.id(), Time::from_nanos(40)).await.unwrap();
        assert_eq!((sink.tables, sink.rows), (1, 1));
        assert_eq!(sink.watermark, Some(Time::from_nanos(40)));
    }
}
