//! Query pipeline
//!
//! [`QueryService`] runs one read end to end: scope resolution, parameter
//! parsing, bucket planning, metric name resolution, store execution and
//! result shaping. All input validation happens before the first store
//! call. Store calls run under a timeout and are timed, and every failure
//! is logged and counted here so HTTP handlers stay thin.

use crate::error::{QueryError, Result};
use crate::metric_names;
use crate::models::{
    AgentItem, ClusterItem, MetricNameItem, NodeItem, SeriesRow, SnapshotRow,
};
use crate::observability::{QueryMetrics, StructuredLogger};
use crate::plan::{SeriesPlan, SnapshotPlan, SummaryPlan};
use crate::request::ParsedQuery;
use crate::scope::{EndpointFamily, EntityId, Scope, CLUSTER_ID, NODE_ID};
use crate::shaper::{group_by, group_by_cluster, rollup_map, RollupKey, Shaped};
use crate::store::{MetricStore, RowSet};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rows grouped under the name of the entity they belong to
pub type Grouped<T> = BTreeMap<String, Vec<T>>;

/// `group -> {metric -> value}`
pub type Rollup = BTreeMap<String, BTreeMap<String, f64>>;

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// A payload together with the time spent in the store producing it
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<T> {
    pub data: T,
    pub elapsed: Duration,
}

impl<T> Timed<T> {
    /// Store time as reported in the response envelope
    pub fn db_query_time(&self) -> String {
        format!("{:?}", self.elapsed)
    }
}

/// Series payload: grouped by entity, or flat for the cluster rollup
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesData {
    Grouped(Grouped<SeriesRow>),
    Flat(Vec<SeriesRow>),
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn MetricStore>,
    timeout: Duration,
    clock: Clock,
    metrics: QueryMetrics,
    logger: StructuredLogger,
}

impl QueryService {
    pub fn new(store: Arc<dyn MetricStore>, timeout: Duration) -> Self {
        Self {
            store,
            timeout,
            clock: Arc::new(Utc::now),
            metrics: QueryMetrics::new(),
            logger: StructuredLogger::new("query-service"),
        }
    }

    /// Replace the clock that anchors snapshot and summary windows
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn metrics(&self) -> &QueryMetrics {
        &self.metrics
    }

    /// Run a store call under the timeout, recording latency and failures
    async fn run<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<(T, Duration)> {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(self.timeout)),
        };
        let elapsed = start.elapsed();
        self.metrics.observe_store_latency(operation, elapsed.as_secs_f64());

        match result {
            Ok(value) => Ok((value, elapsed)),
            Err(e) => {
                if !e.is_client_error() {
                    self.metrics.inc_store_failures();
                    self.logger.log_store_failure(operation, &e.to_string());
                }
                Err(e)
            }
        }
    }

    /// Drop undecodable rows, logging and counting each one
    fn shape<T>(&self, operation: &'static str, rows: RowSet<T>) -> Vec<T> {
        let shaped = Shaped::split(rows);
        if !shaped.skipped.is_empty() {
            for error in &shaped.skipped {
                self.logger.log_row_skipped(operation, &error.to_string());
            }
            self.metrics.add_rows_skipped(shaped.skipped.len() as u64);
        }
        shaped.rows
    }

    fn finish<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_client_error() {
                self.metrics.inc_rejected(e.kind());
                self.logger.log_request_rejected(operation, &e.to_string());
            }
        }
        result
    }

    fn optional_id(param: &'static str, raw: Option<&str>) -> Result<Option<EntityId>> {
        match raw.map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => EntityId::parse(param, raw).map(Some),
        }
    }

    /// Check that the store is reachable
    pub async fn health(&self) -> Result<()> {
        self.run("ping", self.store.ping()).await.map(|_| ())
    }

    pub async fn clusters(&self) -> Result<Timed<Vec<ClusterItem>>> {
        let (rows, elapsed) = self.run("clusters", self.store.clusters()).await?;
        Ok(Timed {
            data: self.shape("clusters", rows),
            elapsed,
        })
    }

    /// Agents grouped by cluster name, optionally for one cluster
    pub async fn agents(&self, cluster_id: Option<&str>) -> Result<Timed<Grouped<AgentItem>>> {
        let result = async {
            let cluster_id = Self::optional_id(CLUSTER_ID, cluster_id)?;
            let (rows, elapsed) = self.run("agents", self.store.agents(cluster_id)).await?;
            Ok::<_, QueryError>(Timed {
                data: group_by_cluster(self.shape("agents", rows)),
                elapsed,
            })
        }
        .await;
        self.finish("agents", result)
    }

    /// Nodes grouped by cluster name, optionally for one cluster
    pub async fn nodes(&self, cluster_id: Option<&str>) -> Result<Timed<Grouped<NodeItem>>> {
        let result = async {
            let cluster_id = Self::optional_id(CLUSTER_ID, cluster_id)?;
            let (rows, elapsed) = self.run("nodes", self.store.nodes(cluster_id)).await?;
            Ok::<_, QueryError>(Timed {
                data: group_by_cluster(self.shape("nodes", rows)),
                elapsed,
            })
        }
        .await;
        self.finish("nodes", result)
    }

    pub async fn metric_names(&self) -> Result<Timed<Vec<MetricNameItem>>> {
        let (rows, elapsed) = self.run("metric_names", self.store.metric_names()).await?;
        Ok(Timed {
            data: self.shape("metric_names", rows),
            elapsed,
        })
    }

    /// Latest value per series, grouped by entity name
    pub async fn snapshot(
        &self,
        family: EndpointFamily,
        path: &HashMap<String, String>,
        query: &[(String, String)],
    ) -> Result<Timed<Grouped<SnapshotRow>>> {
        let result = async {
            let scope = Scope::resolve(family, path)?;
            let query = ParsedQuery::parse(query.iter().map(|(k, v)| (k, v)))?;
            let (metrics, _) = self
                .run("metric_names", metric_names::resolve(self.store.as_ref(), &query.metric_names))
                .await?;

            let plan = SnapshotPlan::new(scope, family.level(), metrics, (self.clock)());
            let (rows, elapsed) = self.run("snapshot", self.store.snapshot(&plan)).await?;

            Ok::<_, QueryError>(Timed {
                data: group_by(self.shape("snapshot", rows), |row| row.entity.name().to_string()),
                elapsed,
            })
        }
        .await;
        self.finish("snapshot", result)
    }

    /// Bucketed series; grouped by entity name except for the cluster rollup
    pub async fn series(
        &self,
        family: EndpointFamily,
        path: &HashMap<String, String>,
        query: &[(String, String)],
    ) -> Result<Timed<SeriesData>> {
        let result = async {
            let scope = Scope::resolve(family, path)?;
            let query = ParsedQuery::parse(query.iter().map(|(k, v)| (k, v)))?;
            query.require_series()?;
            let window = query.window()?;
            let (metrics, _) = self
                .run("metric_names", metric_names::resolve(self.store.as_ref(), &query.metric_names))
                .await?;

            let plan = SeriesPlan::new(scope, family.level(), metrics, window);
            tracing::debug!(bucket = %plan.rule(), "Planned series query");
            let (rows, elapsed) = self.run("series", self.store.series(&plan)).await?;
            let rows = self.shape("series", rows);

            let data = match family {
                EndpointFamily::ClusterSummary => SeriesData::Flat(rows),
                _ => SeriesData::Grouped(group_by(rows, |row| row.entity.name().to_string())),
            };
            Ok::<_, QueryError>(Timed { data, elapsed })
        }
        .await;
        self.finish("series", result)
    }

    /// Latest node values summed per cluster, keyed by cluster id
    pub async fn summary_clusters(&self, cluster_id: Option<&str>) -> Result<Timed<Rollup>> {
        let result = async {
            let cluster_id = Self::optional_id(CLUSTER_ID, cluster_id)?;
            let plan = SummaryPlan::clusters(cluster_id, (self.clock)());
            let (rows, elapsed) = self.run("summary", self.store.summary(&plan)).await?;

            Ok::<_, QueryError>(Timed {
                data: rollup_map(self.shape("summary", rows), RollupKey::Id),
                elapsed,
            })
        }
        .await;
        self.finish("summary_clusters", result)
    }

    /// Latest node values per node of a cluster, keyed by host
    pub async fn summary_nodes(&self, cluster_id: Option<&str>, node_id: Option<&str>) -> Result<Timed<Rollup>> {
        let result = async {
            let cluster_id = Self::optional_id(CLUSTER_ID, cluster_id)?
                .ok_or(QueryError::MissingParameter(CLUSTER_ID))?;
            let node_id = Self::optional_id(NODE_ID, node_id)?;
            let plan = SummaryPlan::nodes(cluster_id, node_id, (self.clock)());
            let (rows, elapsed) = self.run("summary", self.store.summary(&plan)).await?;

            Ok::<_, QueryError>(Timed {
                data: rollup_map(self.shape("summary", rows), RollupKey::Name),
                elapsed,
            })
        }
        .await;
        self.finish("summary_nodes", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MetricSample};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn path(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    async fn service() -> (Arc<MemoryStore>, QueryService) {
        let store = Arc::new(MemoryStore::new());
        store.add_cluster(1, "prod", false).await;
        store
            .add_node(
                1,
                NodeItem {
                    id: 1,
                    host: "node-a".into(),
                    ip: "10.0.0.1".into(),
                    os: "linux".into(),
                    platform: "ubuntu".into(),
                    platform_family: "debian".into(),
                    platform_version: "22.04".into(),
                    agent_id: 1,
                },
            )
            .await;
        store.add_metric_name(1, "cpu", "cpu usage", "gauge").await;
        store.add_label(1, "total").await;

        let service = QueryService::new(store.clone(), Duration::from_secs(5)).with_clock(now);
        (store, service)
    }

    #[tokio::test]
    async fn test_snapshot_groups_by_host() {
        let (store, service) = service().await;
        store
            .insert(MetricSample::new(1, 1, 1, 1, now() - chrono::Duration::seconds(5), 42.0))
            .await;

        let result = service
            .snapshot(EndpointFamily::Nodes, &path(&[("clusterId", "1")]), &[])
            .await
            .unwrap();

        assert_eq!(result.data["node-a"].len(), 1);
        assert_eq!(result.data["node-a"][0].value, 42.0);
    }

    #[tokio::test]
    async fn test_unknown_metric_fails_before_query() {
        let (_, service) = service().await;
        let err = service
            .snapshot(
                EndpointFamily::Nodes,
                &path(&[("clusterId", "1")]),
                &query(&[("metricNames", "cpu"), ("metricNames", "doesnotexist")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::UnknownMetricName { .. }));
    }

    #[tokio::test]
    async fn test_series_validation_precedes_store() {
        let (store, service) = service().await;
        store.set_unavailable(true);

        // Invalid input is reported as such even while the store is down
        let err = service
            .series(
                EndpointFamily::Nodes,
                &path(&[("clusterId", "1")]),
                &query(&[("metricNames", "cpu"), ("dateRange", "2024-01-01 00:00:00")]),
            )
            .await
            .unwrap_err();
        assert!(err.is_client_error());

        let err = service
            .series(
                EndpointFamily::Nodes,
                &path(&[("clusterId", "1")]),
                &query(&[
                    ("metricNames", "cpu"),
                    ("dateRange", "2024-01-01 00:00:00"),
                    ("dateRange", "2024-01-01 01:00:00"),
                ]),
            )
            .await
            .unwrap_err();
        assert!(!err.is_client_error());
    }

    #[tokio::test]
    async fn test_cluster_series_is_flat() {
        let (store, service) = service().await;
        store
            .insert(MetricSample::new(1, 1, 1, 1, Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap(), 3.0))
            .await;

        let result = service
            .series(
                EndpointFamily::ClusterSummary,
                &path(&[("clusterId", "1")]),
                &query(&[
                    ("metricNames", "cpu"),
                    ("dateRange", "2024-01-01 00:00:00"),
                    ("dateRange", "2024-01-01 01:00:00"),
                ]),
            )
            .await
            .unwrap();

        match result.data {
            SeriesData::Flat(rows) => assert_eq!(rows.len(), 1),
            other => panic!("expected flat series, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_skipped_rows_are_counted() {
        let (store, service) = service().await;
        let ts = now() - chrono::Duration::seconds(5);
        store.insert(MetricSample::new(1, 1, 1, 1, ts, 1.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 99, ts, 1.0)).await;
        let before = service.metrics().rows_skipped();

        let result = service
            .snapshot(EndpointFamily::Nodes, &path(&[("clusterId", "1")]), &[])
            .await
            .unwrap();

        assert_eq!(result.data["node-a"].len(), 1);
        assert!(service.metrics().rows_skipped() > before);
    }

    #[tokio::test]
    async fn test_summary_nodes_requires_cluster() {
        let (_, service) = service().await;
        let err = service.summary_nodes(None, None).await.unwrap_err();
        assert!(matches!(err, QueryError::MissingParameter("clusterId")));
    }

    #[tokio::test]
    async fn test_summary_clusters_keyed_by_id() {
        let (store, service) = service().await;
        store
            .insert(MetricSample::new(1, 1, 1, 1, now() - chrono::Duration::seconds(5), 7.0))
            .await;

        let result = service.summary_clusters(None).await.unwrap();
        assert_eq!(result.data["1"]["cpu"], 7.0);
    }
}
