//! In-memory storage backend serving every read shape.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::memory::Allocator;
use super::reader::{BoxTableIterator, CursorStats, ReadError, ReadResult, Reader, TableBuffer};
use super::table::Table;
use crate::query::group::GroupMode;
use crate::query::id::Id;
use crate::query::predicate::Predicate;
use crate::query::spec::{ReadFilterSpec, ReadGroupSpec, ReadSpec, ReadTagKeysSpec, ReadTagValuesSpec};
use crate::query::time::{Bounds, Time};

/// Aggregate methods understood by the in-memory store
pub const AGGREGATE_METHODS: &[&str] = &["count", "sum", "min", "max", "mean", "first", "last"];

const POINT_BYTES: u64 = (std::mem::size_of::<Time>() + std::mem::size_of::<f64>()) as u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemStoreError {
    #[error("Timestamp not strictly increasing for series {0}")]
    NonIncreasingTimestamp(String),
    #[error("Store is closed")]
    Closed,
}

type TagSet = BTreeMap<String, String>;
type Points = Vec<(Time, f64)>;

/// Series of one bucket, keyed by tag set
#[derive(Debug, Default)]
struct Bucket {
    series: BTreeMap<TagSet, Points>,
}

/// A series (or merged group of series) selected by a read
#[derive(Debug, Clone)]
struct SeriesData {
    tags: TagSet,
    points: Points,
}

/// In-process storage backend.
///
/// Results are materialised eagerly per call and charged to the caller's
/// allocator table by table until the caller consumes them.
#[derive(Debug, Default)]
pub struct MemStore {
    buckets: RwLock<HashMap<(Id, Id), Bucket>>,
    closed: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes one point to a series; timestamps must strictly increase per series
    pub async fn write(
        &self,
        organization_id: Id,
        bucket_id: Id,
        tags: &[(&str, &str)],
        time: Time,
        value: f64,
    ) -> Result<(), MemStoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MemStoreError::Closed);
        }
        let tags: TagSet = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let label = series_label(&tags);

        let mut buckets = self.buckets.write().await;
        let points = buckets
            .entry((organization_id, bucket_id))
            .or_default()
            .series
            .entry(tags)
            .or_default();

        if let Some((last, _)) = points.last() {
            if time <= *last {
                return Err(MemStoreError::NonIncreasingTimestamp(label));
            }
        }
        points.push((time, value));
        Ok(())
    }

    fn check_open(&self, cancel: &CancellationToken) -> ReadResult<()> {
        if cancel.is_cancelled() {
            return Err(ReadError::Cancelled);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(ReadError::Unavailable("store is closed".to_string()));
        }
        Ok(())
    }

    /// Collects the points of every matching series inside `bounds`
    async fn select(
        &self,
        organization_id: Id,
        bucket_id: Id,
        bounds: Bounds,
        predicate: Option<&Predicate>,
    ) -> ReadResult<(Vec<SeriesData>, CursorStats)> {
        let buckets = self.buckets.read().await;
        let bucket = buckets.get(&(organization_id, bucket_id)).ok_or_else(|| {
            ReadError::Rejected(format!(
                "bucket {} not found in organization {}",
                bucket_id, organization_id
            ))
        })?;

        let mut stats = CursorStats::default();
        let mut selected = Vec::new();
        for (tags, points) in &bucket.series {
            if !predicate.map_or(true, |p| p.matches(tags)) {
                continue;
            }
            let in_range: Points = points
                .iter()
                .filter(|(t, _)| bounds.contains(*t))
                .copied()
                .collect();
            if in_range.is_empty() {
                continue;
            }
            stats.scanned_values += in_range.len() as u64;
            stats.scanned_bytes += in_range.len() as u64 * POINT_BYTES;
            selected.push(SeriesData {
                tags: tags.clone(),
                points: in_range,
            });
        }
        Ok((selected, stats))
    }
}

fn series_label(tags: &TagSet) -> String {
    tags.iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn validate_grouping(mode: GroupMode, keys: &[String], aggregate: &str) -> ReadResult<()> {
    if mode.uses_keys() && keys.is_empty() {
        return Err(ReadError::Rejected(format!(
            "group mode {} requires at least one group key",
            mode
        )));
    }
    if !aggregate.is_empty() && !AGGREGATE_METHODS.contains(&aggregate) {
        return Err(ReadError::Rejected(format!(
            "unknown aggregate method: {}",
            aggregate
        )));
    }
    Ok(())
}

/// Partitions the selected series into groups, merging points by time
fn group_series(series: Vec<SeriesData>, mode: GroupMode, keys: &[String]) -> Vec<SeriesData> {
    if matches!(mode, GroupMode::Default | GroupMode::All) {
        return series;
    }

    let mut groups: BTreeMap<TagSet, Points> = BTreeMap::new();
    for data in series {
        let key: TagSet = match mode {
            GroupMode::None => TagSet::new(),
            GroupMode::By => data
                .tags
                .into_iter()
                .filter(|(k, _)| keys.contains(k))
                .collect(),
            GroupMode::Except => data
                .tags
                .into_iter()
                .filter(|(k, _)| !keys.contains(k))
                .collect(),
            GroupMode::Default | GroupMode::All => unreachable!(),
        };
        groups.entry(key).or_default().extend(data.points);
    }

    groups
        .into_iter()
        .map(|(tags, mut points)| {
            points.sort_by_key(|(t, _)| *t);
            SeriesData { tags, points }
        })
        .collect()
}

fn aggregate(method: &str, points: &[(Time, f64)]) -> Option<(Time, f64)> {
    let (first, last) = (points.first()?, points.last()?);
    let values = points.iter().map(|(_, v)| *v);
    let value = match method {
        "count" => points.len() as f64,
        "sum" => values.sum(),
        "min" => values.fold(f64::INFINITY, f64::min),
        "max" => values.fold(f64::NEG_INFINITY, f64::max),
        "mean" => values.sum::<f64>() / points.len() as f64,
        "first" => return Some(*first),
        "last" => return Some(*last),
        _ => return None,
    };
    Some((last.0, value))
}

fn apply_aggregate(groups: Vec<SeriesData>, method: &str) -> Vec<SeriesData> {
    if method.is_empty() {
        return groups;
    }
    groups
        .into_iter()
        .filter_map(|group| {
            let point = aggregate(method, &group.points)?;
            Some(SeriesData {
                tags: group.tags,
                points: vec![point],
            })
        })
        .collect()
}

fn into_tables(groups: Vec<SeriesData>) -> Vec<Table> {
    groups
        .into_iter()
        .map(|group| {
            let (times, values) = group.points.into_iter().unzip();
            Table::series(group.tags, times, values)
        })
        .collect()
}

/// Re-slices groups time-major: every group's rows for one time come
/// before any row of a later time.
fn time_major(groups: Vec<SeriesData>, descending: bool) -> Vec<SeriesData> {
    let mut rows: Vec<(Time, usize, f64)> = groups
        .iter()
        .enumerate()
        .flat_map(|(i, g)| g.points.iter().map(move |(t, v)| (*t, i, *v)))
        .collect();
    if descending {
        rows.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    } else {
        rows.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    }

    let mut out: Vec<SeriesData> = Vec::new();
    let mut current: Option<(Time, usize)> = None;
    for (t, i, v) in rows {
        if current == Some((t, i)) {
            if let Some(last) = out.last_mut() {
                last.points.push((t, v));
            }
            continue;
        }
        current = Some((t, i));
        out.push(SeriesData {
            tags: groups[i].tags.clone(),
            points: vec![(t, v)],
        });
    }
    out
}

fn string_table(values: BTreeSet<String>) -> Vec<Table> {
    if values.is_empty() {
        return Vec::new();
    }
    vec![Table::strings(TagSet::new(), values.into_iter().collect())]
}

#[async_trait]
impl Reader for MemStore {
    async fn read_filter(
        &self,
        cancel: &CancellationToken,
        spec: &ReadFilterSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator> {
        self.check_open(cancel)?;
        let (series, stats) = self
            .select(spec.organization_id, spec.bucket_id, spec.bounds, spec.predicate.as_ref())
            .await?;

        let tables = into_tables(series);
        Ok(TableBuffer::charged(tables, stats, alloc)?.boxed())
    }

    async fn read_group(
        &self,
        cancel: &CancellationToken,
        spec: &ReadGroupSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator> {
        self.check_open(cancel)?;
        validate_grouping(spec.group_mode, &spec.group_keys, &spec.aggregate_method)?;
        let filter = &spec.filter;
        let (series, stats) = self
            .select(filter.organization_id, filter.bucket_id, filter.bounds, filter.predicate.as_ref())
            .await?;

        let groups = group_series(series, spec.group_mode, &spec.group_keys);
        let tables = into_tables(apply_aggregate(groups, &spec.aggregate_method));
        Ok(TableBuffer::charged(tables, stats, alloc)?.boxed())
    }

    async fn read_tag_keys(
        &self,
        cancel: &CancellationToken,
        spec: &ReadTagKeysSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator> {
        self.check_open(cancel)?;
        let filter = &spec.filter;
        let (series, stats) = self
            .select(filter.organization_id, filter.bucket_id, filter.bounds, filter.predicate.as_ref())
            .await?;

        let keys: BTreeSet<String> = series
            .into_iter()
            .flat_map(|s| s.tags.into_keys())
            .collect();
        let tables = string_table(keys);
        Ok(TableBuffer::charged(tables, stats, alloc)?.boxed())
    }

    async fn read_tag_values(
        &self,
        cancel: &CancellationToken,
        spec: &ReadTagValuesSpec,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator> {
        self.check_open(cancel)?;
        let filter = &spec.filter;
        let (series, stats) = self
            .select(filter.organization_id, filter.bucket_id, filter.bounds, filter.predicate.as_ref())
            .await?;

        let values: BTreeSet<String> = series
            .into_iter()
            .filter_map(|mut s| s.tags.remove(&spec.tag_key))
            .collect();
        let tables = string_table(values);
        Ok(TableBuffer::charged(tables, stats, alloc)?.boxed())
    }

    async fn read(
        &self,
        cancel: &CancellationToken,
        spec: &ReadSpec,
        start: Time,
        stop: Time,
        alloc: &Arc<Allocator>,
    ) -> ReadResult<BoxTableIterator> {
        self.check_open(cancel)?;
        validate_grouping(spec.group_mode, &spec.group_keys, &spec.aggregate_method)?;
        let filter = spec.filter_spec(Bounds { start, stop });
        let (mut series, stats) = self
            .select(filter.organization_id, filter.bucket_id, filter.bounds, filter.predicate.as_ref())
            .await?;

        let offset = spec.series_offset.max(0) as usize;
        series.drain(..offset.min(series.len()));
        if spec.series_limit > 0 {
            series.truncate(spec.series_limit as usize);
        }

        let mut groups = apply_aggregate(
            group_series(series, spec.group_mode, &spec.group_keys),
            &spec.aggregate_method,
        );
        for group in &mut groups {
            if spec.descending {
                group.points.reverse();
            }
            if spec.points_limit > 0 {
                group.points.truncate(spec.points_limit as usize);
            }
        }
        if spec.order_by_time {
            groups = time_major(groups, spec.descending);
        }

        let tables = into_tables(groups);
        debug!(
            "Read window [{}, {}): tables={}, scanned_values={}",
            start.nanos(),
            stop.nanos(),
            tables.len(),
            stats.scanned_values
        );
        Ok(TableBuffer::charged(tables, stats, alloc)?.boxed())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed in-memory store");
        }
    }
}
