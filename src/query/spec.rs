//! Read descriptors: what a storage read should return.
//!
//! These are plain data. Nonsensical combinations (for example
//! [`GroupMode::By`] with no keys) are accepted here and left to the
//! backend to reject.

use super::group::GroupMode;
use super::id::Id;
use super::predicate::Predicate;
use super::time::Bounds;

/// Selects the series of one bucket over a time range
#[derive(Debug, Clone, PartialEq)]
pub struct ReadFilterSpec {
    pub organization_id: Id,
    pub bucket_id: Id,
    pub bounds: Bounds,
    pub predicate: Option<Predicate>,
}

impl ReadFilterSpec {
    pub fn new(organization_id: Id, bucket_id: Id, bounds: Bounds) -> Self {
        Self {
            organization_id,
            bucket_id,
            bounds,
            predicate: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }
}

/// A filtered read whose series are grouped and optionally aggregated
#[derive(Debug, Clone, PartialEq)]
pub struct ReadGroupSpec {
    pub filter: ReadFilterSpec,
    pub group_mode: GroupMode,
    /// Only meaningful when `group_mode` is `By` or `Except`.
    pub group_keys: Vec<String>,
    /// Empty means no aggregation.
    pub aggregate_method: String,
}

impl ReadGroupSpec {
    pub fn new(filter: ReadFilterSpec, group_mode: GroupMode, group_keys: Vec<String>) -> Self {
        Self {
            filter,
            group_mode,
            group_keys,
            aggregate_method: String::new(),
        }
    }

    pub fn with_aggregate(mut self, method: impl Into<String>) -> Self {
        self.aggregate_method = method.into();
        self
    }
}

/// Enumerates the distinct tag keys of the matching series
#[derive(Debug, Clone, PartialEq)]
pub struct ReadTagKeysSpec {
    pub filter: ReadFilterSpec,
}

/// Enumerates the distinct values of one tag key across the matching series
#[derive(Debug, Clone, PartialEq)]
pub struct ReadTagValuesSpec {
    pub filter: ReadFilterSpec,
    pub tag_key: String,
}

/// Descriptor for the legacy windowed read.
///
/// It carries no time bounds; the scheduler supplies them per window.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSpec {
    pub organization_id: Id,
    pub bucket_id: Id,

    pub ram_limit: u64,
    pub hosts: Vec<String>,
    pub predicate: Option<Predicate>,
    /// Zero means unlimited.
    pub points_limit: i64,
    /// Zero means unlimited.
    pub series_limit: i64,
    pub series_offset: i64,
    pub descending: bool,

    pub aggregate_method: String,

    /// When set, all series for a time are produced before any series for a
    /// later time. Otherwise every point of a series is produced before the
    /// next series starts.
    pub order_by_time: bool,
    pub group_mode: GroupMode,
    /// Grouping dimensions for `By`, or the excluded ones for `Except`.
    pub group_keys: Vec<String>,

    /// Required by single-node deployments.
    pub database: String,
    /// Required by single-node deployments.
    pub retention_policy: String,
}

impl ReadSpec {
    pub fn new(organization_id: Id, bucket_id: Id) -> Self {
        Self {
            organization_id,
            bucket_id,
            ram_limit: 0,
            hosts: Vec::new(),
            predicate: None,
            points_limit: 0,
            series_limit: 0,
            series_offset: 0,
            descending: false,
            aggregate_method: String::new(),
            order_by_time: false,
            group_mode: GroupMode::Default,
            group_keys: Vec::new(),
            database: String::new(),
            retention_policy: String::new(),
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn with_grouping(mut self, mode: GroupMode, keys: Vec<String>) -> Self {
        self.group_mode = mode;
        self.group_keys = keys;
        self
    }

    pub fn with_aggregate(mut self, method: impl Into<String>) -> Self {
        self.aggregate_method = method.into();
        self
    }

    pub fn with_series_limit(mut self, limit: i64, offset: i64) -> Self {
        self.series_limit = limit;
        self.series_offset = offset;
        self
    }

    pub fn with_points_limit(mut self, limit: i64) -> Self {
        self.points_limit = limit;
        self
    }

    /// Narrows this descriptor to a filter read over explicit bounds
    pub fn filter_spec(&self, bounds: Bounds) -> ReadFilterSpec {
        ReadFilterSpec {
            organization_id: self.organization_id,
            bucket_id: self.bucket_id,
            bounds,
            predicate: self.predicate.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::predicate::TagFilterOp;

    fn ids() -> (Id, Id) {
        (Id::new(1).unwrap(), Id::new(2).unwrap())
    }

    #[test]
    fn test_read_spec_defaults() {
        let (org, bucket) = ids();
        let spec = ReadSpec::new(org, bucket);

        assert_eq!(spec.group_mode, GroupMode::Default);
        assert!(spec.group_keys.is_empty());
        assert!(!spec.descending);
        assert_eq!(spec.points_limit, 0);
    }

    #[test]
    fn test_invalid_combinations_are_carried() {
        let (org, bucket) = ids();
        let filter = ReadFilterSpec::new(org, bucket, Bounds::new(0, 10));
        let spec = ReadGroupSpec::new(filter, GroupMode::By, Vec::new());

        assert_eq!(spec.group_mode, GroupMode::By);
        assert!(spec.group_keys.is_empty());
    }

    #[test]
    fn test_filter_spec_from_read_spec() {
        let (org, bucket) = ids();
        let predicate = Predicate::tag("host", TagFilterOp::Eq, "a");
        let spec = ReadSpec::new(org, bucket).with_predicate(predicate.clone());

        let filter = spec.filter_spec(Bounds::new(5, 15));
        assert_eq!(filter.bounds, Bounds::new(5, 15));
        assert_eq!(filter.predicate, Some(predicate));
        assert_eq!(filter.bucket_id, bucket);
    }
}
