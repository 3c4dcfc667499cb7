//! Query plans
//!
//! A plan is the typed, store-independent description of one read: which
//! rows qualify (scope, level, metric ids, time bounds) and how they are
//! collapsed (latest per series, or mean per bucket, optionally summed
//! across child entities). Stores turn plans into SQL with bound
//! parameters, or evaluate them directly.

use crate::granularity::{BucketRule, DateRange, SeriesWindow};
use crate::scope::{EntityId, EntityLevel, QueryLevel, Scope};
use chrono::{DateTime, Duration, Utc};

/// Freshness window for snapshot and summary queries
pub const SNAPSHOT_WINDOW_SECS: i64 = 60;

/// Resolved metric-name identifiers; empty means "all metrics"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricFilter(Vec<i64>);

impl MetricFilter {
    pub fn new(ids: Vec<i64>) -> Self {
        Self(ids)
    }

    pub fn all() -> Self {
        Self(Vec::new())
    }

    pub fn ids(&self) -> &[i64] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, name_id: i64) -> bool {
        self.0.is_empty() || self.0.contains(&name_id)
    }
}

/// Latest value per (entity, metric, label) inside the freshness window
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPlan {
    pub scope: Scope,
    pub level: QueryLevel,
    pub metrics: MetricFilter,
    /// Oldest timestamp still considered fresh
    pub since: DateTime<Utc>,
}

impl SnapshotPlan {
    pub fn new(scope: Scope, level: QueryLevel, metrics: MetricFilter, as_of: DateTime<Utc>) -> Self {
        Self {
            scope,
            level,
            metrics,
            since: as_of - Duration::seconds(SNAPSHOT_WINDOW_SECS),
        }
    }

    pub fn row_level(&self) -> EntityLevel {
        self.level.row_level()
    }
}

/// Mean per (entity, metric, label, bucket) over a half-open range
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPlan {
    pub scope: Scope,
    pub level: QueryLevel,
    pub metrics: MetricFilter,
    pub window: SeriesWindow,
}

impl SeriesPlan {
    pub fn new(scope: Scope, level: QueryLevel, metrics: MetricFilter, window: SeriesWindow) -> Self {
        Self {
            scope,
            level,
            metrics,
            window,
        }
    }

    pub fn range(&self) -> &DateRange {
        &self.window.range
    }

    pub fn rule(&self) -> &BucketRule {
        &self.window.rule
    }
}

/// What a summary rollup groups by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryGrouping {
    Cluster,
    Node,
}

/// Sum of the latest node-level values per cluster or node and metric
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryPlan {
    pub grouping: SummaryGrouping,
    pub cluster_id: Option<EntityId>,
    pub node_id: Option<EntityId>,
    pub since: DateTime<Utc>,
}

impl SummaryPlan {
    pub fn clusters(cluster_id: Option<EntityId>, as_of: DateTime<Utc>) -> Self {
        Self {
            grouping: SummaryGrouping::Cluster,
            cluster_id,
            node_id: None,
            since: as_of - Duration::seconds(SNAPSHOT_WINDOW_SECS),
        }
    }

    pub fn nodes(cluster_id: EntityId, node_id: Option<EntityId>, as_of: DateTime<Utc>) -> Self {
        Self {
            grouping: SummaryGrouping::Node,
            cluster_id: Some(cluster_id),
            node_id,
            since: as_of - Duration::seconds(SNAPSHOT_WINDOW_SECS),
        }
    }
}
