//! In-memory metrics store
//!
//! Holds the catalog tables and fact rows in process and evaluates plans
//! with the same semantics as the PostgreSQL renderer: latest row per series
//! for snapshots, mean per bucket for series, and sums across child entities
//! for rollups. Used for tests and for running the server without a
//! database.

use super::{async_trait, MetricStore, RowSet};
use crate::error::{QueryError, Result, RowError};
use crate::granularity::DateRange;
use crate::models::{
    round2, AgentItem, ClusterItem, EntityRef, MetricNameItem, NodeItem, Owned, RollupRow,
    SeriesRow, SnapshotRow,
};
use crate::plan::{MetricFilter, SeriesPlan, SnapshotPlan, SummaryGrouping, SummaryPlan};
use crate::scope::{EntityId, EntityLevel, QueryLevel, Scope};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;

/// One row of the metrics fact table
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub cluster_id: i64,
    pub node_id: i64,
    /// 0 unless the row describes a process
    pub process_id: i64,
    /// 0 unless the row describes a container
    pub container_id: i64,
    pub name_id: i64,
    pub label_id: i64,
    pub ts: DateTime<Utc>,
    pub value: f64,
}

impl MetricSample {
    /// A node-level sample
    pub fn new(
        cluster_id: i64,
        node_id: i64,
        name_id: i64,
        label_id: i64,
        ts: DateTime<Utc>,
        value: f64,
    ) -> Self {
        Self {
            cluster_id,
            node_id,
            process_id: 0,
            container_id: 0,
            name_id,
            label_id,
            ts,
            value,
        }
    }

    pub fn with_process(mut self, process_id: i64) -> Self {
        self.process_id = process_id;
        self
    }

    pub fn with_container(mut self, container_id: i64) -> Self {
        self.container_id = container_id;
        self
    }

    fn series_key(&self) -> (i64, i64, i64, i64, i64) {
        (
            self.node_id,
            self.process_id,
            self.container_id,
            self.name_id,
            self.label_id,
        )
    }

    fn in_scope(&self, scope: &Scope, level: EntityLevel, metrics: &MetricFilter) -> bool {
        self.cluster_id == scope.cluster_id.get()
            && scope.node_id.map_or(true, |id| self.node_id == id.get())
            && scope.process_id.map_or(true, |id| self.process_id == id.get())
            && scope.container_id.map_or(true, |id| self.container_id == id.get())
            && EntityLevel::of_row(self.process_id, self.container_id) == Some(level)
            && metrics.matches(self.name_id)
    }
}

struct ContainerRecord {
    name: String,
    /// Runtime container id, the key into the Kubernetes link table
    external_id: String,
}

struct PodRecord {
    namespace_id: i64,
    name: String,
}

#[derive(Default)]
struct Tables {
    clusters: BTreeMap<i64, String>,
    k8s_clusters: HashSet<i64>,
    agents: BTreeMap<i64, (i64, AgentItem)>,
    nodes: BTreeMap<i64, (i64, NodeItem)>,
    processes: HashMap<i64, String>,
    containers: HashMap<i64, ContainerRecord>,
    namespaces: HashMap<i64, String>,
    pods: HashMap<i64, PodRecord>,
    k8s_containers: HashMap<String, i64>,
    metric_names: BTreeMap<i64, MetricNameItem>,
    labels: HashMap<i64, String>,
    samples: Vec<MetricSample>,
}

type Resolved<T> = std::result::Result<T, RowError>;

fn missing(table: &'static str, id: i64) -> RowError {
    RowError::MissingReference { table, id }
}

/// Sort key matching the SQL entity ordering (pods by name, others by id)
fn order_key(entity: &EntityRef) -> (String, i64) {
    match entity {
        EntityRef::Node { id, .. } | EntityRef::Process { id, .. } | EntityRef::Container { id, .. } => {
            (String::new(), *id)
        }
        EntityRef::Pod { id, name, .. } => (name.clone(), *id),
        EntityRef::Cluster => (String::new(), 0),
    }
}

impl Tables {
    fn metric_name(&self, name_id: i64) -> Resolved<String> {
        self.metric_names
            .get(&name_id)
            .map(|m| m.name.clone())
            .ok_or_else(|| missing("metric_names", name_id))
    }

    fn label(&self, level: QueryLevel, label_id: i64) -> Resolved<Option<String>> {
        if level.is_rollup() {
            return Ok(None);
        }
        self.labels
            .get(&label_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| missing("metric_labels", label_id))
    }

    /// Entity a sample reports under; `Ok(None)` when joins or pod filters drop it
    fn entity(&self, level: QueryLevel, scope: &Scope, s: &MetricSample) -> Resolved<Option<EntityRef>> {
        let entity = match level {
            QueryLevel::Node => {
                let (_, node) = self.nodes.get(&s.node_id).ok_or_else(|| missing("nodes", s.node_id))?;
                EntityRef::Node {
                    id: node.id,
                    host: node.host.clone(),
                }
            }
            QueryLevel::Process => {
                let name = self
                    .processes
                    .get(&s.process_id)
                    .ok_or_else(|| missing("processes", s.process_id))?;
                EntityRef::Process {
                    id: s.process_id,
                    name: name.clone(),
                }
            }
            QueryLevel::Container => {
                let container = self
                    .containers
                    .get(&s.container_id)
                    .ok_or_else(|| missing("containers", s.container_id))?;
                EntityRef::Container {
                    id: s.container_id,
                    name: container.name.clone(),
                }
            }
            QueryLevel::Pod => {
                let container = self
                    .containers
                    .get(&s.container_id)
                    .ok_or_else(|| missing("containers", s.container_id))?;
                let Some(&pod_id) = self.k8s_containers.get(&container.external_id) else {
                    return Ok(None);
                };
                let pod = self.pods.get(&pod_id).ok_or_else(|| missing("k8s_pods", pod_id))?;
                let namespace = self
                    .namespaces
                    .get(&pod.namespace_id)
                    .ok_or_else(|| missing("k8s_namespaces", pod.namespace_id))?;

                if scope.namespace_id.map_or(false, |id| id.get() != pod.namespace_id)
                    || scope.pod_id.map_or(false, |id| id.get() != pod_id)
                {
                    return Ok(None);
                }
                EntityRef::Pod {
                    id: pod_id,
                    name: pod.name.clone(),
                    namespace: namespace.clone(),
                }
            }
            QueryLevel::Cluster => EntityRef::Cluster,
        };
        Ok(Some(entity))
    }

    /// Latest sample per series among those passing `keep`
    fn latest<'a>(&'a self, keep: impl Fn(&MetricSample) -> bool) -> Vec<&'a MetricSample> {
        let mut latest: BTreeMap<(i64, i64, i64, i64, i64), &MetricSample> = BTreeMap::new();
        for sample in self.samples.iter().filter(|s| keep(*s)) {
            latest
                .entry(sample.series_key())
                .and_modify(|current| {
                    if sample.ts > current.ts {
                        *current = sample;
                    }
                })
                .or_insert(sample);
        }
        latest.into_values().collect()
    }

    fn snapshot(&self, plan: &SnapshotPlan) -> RowSet<SnapshotRow> {
        let row_level = plan.row_level();
        let latest = self.latest(|s| s.ts >= plan.since && s.in_scope(&plan.scope, row_level, &plan.metrics));

        let mut errors = Vec::new();
        let mut rows: BTreeMap<((String, i64), String, String), SnapshotRow> = BTreeMap::new();

        for sample in latest {
            let resolved = self.entity(plan.level, &plan.scope, sample).and_then(|entity| {
                let Some(entity) = entity else { return Ok(None) };
                let metric_name = self.metric_name(sample.name_id)?;
                let metric_label = self.label(plan.level, sample.label_id)?;
                Ok(Some((entity, metric_name, metric_label)))
            });

            let (entity, metric_name, metric_label) = match resolved {
                Ok(Some(parts)) => parts,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(Err(e));
                    continue;
                }
            };

            let key = (
                order_key(&entity),
                metric_name.clone(),
                metric_label.clone().unwrap_or_default(),
            );
            rows.entry(key)
                .and_modify(|row| {
                    row.value += sample.value;
                    row.ts = row.ts.max(sample.ts);
                })
                .or_insert(SnapshotRow {
                    entity,
                    ts: sample.ts,
                    value: sample.value,
                    metric_name,
                    metric_label,
                });
        }

        rows.into_values()
            .map(|mut row| {
                row.value = round2(row.value);
                Ok(row)
            })
            .chain(errors)
            .collect()
    }

    fn series(&self, plan: &SeriesPlan) -> RowSet<SeriesRow> {
        let row_level = plan.level.row_level();
        let range: &DateRange = plan.range();
        let rule = plan.rule();

        // Mean per series and bucket
        let mut buckets: BTreeMap<(NaiveDateTime, (i64, i64, i64, i64, i64)), (f64, u32, &MetricSample)> =
            BTreeMap::new();
        for sample in self
            .samples
            .iter()
            .filter(|s| range.contains(s.ts) && s.in_scope(&plan.scope, row_level, &plan.metrics))
        {
            let entry = buckets
                .entry((rule.bucket_of(sample.ts), sample.series_key()))
                .or_insert((0.0, 0, sample));
            entry.0 += sample.value;
            entry.1 += 1;
        }

        let mut errors = Vec::new();
        let mut rows: BTreeMap<(NaiveDateTime, (String, i64), String, String), SeriesRow> = BTreeMap::new();

        for ((bucket, _), (sum, count, sample)) in buckets {
            let mean = sum / f64::from(count);
            let resolved = self.entity(plan.level, &plan.scope, sample).and_then(|entity| {
                let Some(entity) = entity else { return Ok(None) };
                let metric_name = self.metric_name(sample.name_id)?;
                let metric_label = self.label(plan.level, sample.label_id)?;
                Ok(Some((entity, metric_name, metric_label)))
            });

            let (entity, metric_name, metric_label) = match resolved {
                Ok(Some(parts)) => parts,
                Ok(None) => continue,
                Err(e) => {
                    errors.push(Err(e));
                    continue;
                }
            };

            let key = (
                bucket,
                order_key(&entity),
                metric_name.clone(),
                metric_label.clone().unwrap_or_default(),
            );
            rows.entry(key)
                .and_modify(|row| row.value += mean)
                .or_insert(SeriesRow {
                    entity,
                    bucket,
                    value: mean,
                    metric_name,
                    metric_label,
                });
        }

        rows.into_values()
            .map(|mut row| {
                row.value = round2(row.value);
                Ok(row)
            })
            .chain(errors)
            .collect()
    }

    fn summary(&self, plan: &SummaryPlan) -> RowSet<RollupRow> {
        let latest = self.latest(|s| {
            s.ts >= plan.since
                && EntityLevel::of_row(s.process_id, s.container_id) == Some(EntityLevel::Node)
                && plan.cluster_id.map_or(true, |id| s.cluster_id == id.get())
                && plan.node_id.map_or(true, |id| s.node_id == id.get())
        });

        // One latest row per (node, metric, label), summed per group and metric
        let mut errors = Vec::new();
        let mut rows: BTreeMap<(i64, String), RollupRow> = BTreeMap::new();

        for sample in latest {
            let group = match plan.grouping {
                SummaryGrouping::Cluster => self
                    .clusters
                    .get(&sample.cluster_id)
                    .map(|name| (sample.cluster_id, name.clone()))
                    .ok_or_else(|| missing("clusters", sample.cluster_id)),
                SummaryGrouping::Node => self
                    .nodes
                    .get(&sample.node_id)
                    .map(|(_, node)| (node.id, node.host.clone()))
                    .ok_or_else(|| missing("nodes", sample.node_id)),
            };
            let resolved = group.and_then(|g| Ok((g, self.metric_name(sample.name_id)?)));

            let ((group_id, group_name), metric_name) = match resolved {
                Ok(parts) => parts,
                Err(e) => {
                    errors.push(Err(e));
                    continue;
                }
            };

            rows.entry((group_id, metric_name.clone()))
                .and_modify(|row| row.value += sample.value)
                .or_insert(RollupRow {
                    group_id,
                    group_name,
                    metric_name,
                    value: sample.value,
                });
        }

        rows.into_values()
            .map(|mut row| {
                row.value = round2(row.value);
                Ok(row)
            })
            .chain(errors)
            .collect()
    }
}

/// In-process store evaluating plans directly
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the database were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every call, as a slow database would
    pub fn set_latency(&self, latency: StdDuration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check_available(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(StdDuration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueryError::Backend("metrics store is unavailable".into()));
        }
        Ok(())
    }

    pub async fn add_cluster(&self, id: i64, name: &str, kubernetes: bool) {
        let mut tables = self.tables.write().await;
        tables.clusters.insert(id, name.to_string());
        if kubernetes {
            tables.k8s_clusters.insert(id);
        }
    }

    pub async fn add_agent(&self, cluster_id: i64, agent: AgentItem) {
        self.tables.write().await.agents.insert(agent.id, (cluster_id, agent));
    }

    pub async fn add_node(&self, cluster_id: i64, node: NodeItem) {
        self.tables.write().await.nodes.insert(node.id, (cluster_id, node));
    }

    pub async fn add_process(&self, id: i64, name: &str) {
        self.tables.write().await.processes.insert(id, name.to_string());
    }

    /// Register a container; `external_id` is the runtime id used for pod links
    pub async fn add_container(&self, id: i64, name: &str, external_id: &str) {
        self.tables.write().await.containers.insert(
            id,
            ContainerRecord {
                name: name.to_string(),
                external_id: external_id.to_string(),
            },
        );
    }

    pub async fn add_namespace(&self, id: i64, name: &str) {
        self.tables.write().await.namespaces.insert(id, name.to_string());
    }

    pub async fn add_pod(&self, id: i64, namespace_id: i64, name: &str) {
        self.tables.write().await.pods.insert(
            id,
            PodRecord {
                namespace_id,
                name: name.to_string(),
            },
        );
    }

    /// Attach a runtime container to a pod
    pub async fn link_container(&self, external_id: &str, pod_id: i64) {
        self.tables
            .write()
            .await
            .k8s_containers
            .insert(external_id.to_string(), pod_id);
    }

    pub async fn add_metric_name(&self, id: i64, name: &str, help: &str, metric_type: &str) {
        self.tables.write().await.metric_names.insert(
            id,
            MetricNameItem {
                id,
                name: name.to_string(),
                help: help.to_string(),
                metric_type: metric_type.to_string(),
            },
        );
    }

    pub async fn add_label(&self, id: i64, label: &str) {
        self.tables.write().await.labels.insert(id, label.to_string());
    }

    pub async fn insert(&self, sample: MetricSample) {
        self.tables.write().await.samples.push(sample);
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_available().await
    }

    async fn clusters(&self) -> Result<RowSet<ClusterItem>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .clusters
            .iter()
            .map(|(&id, name)| {
                Ok(ClusterItem {
                    id,
                    name: name.clone(),
                    kubernetes: tables.k8s_clusters.contains(&id),
                })
            })
            .collect())
    }

    async fn agents(&self, cluster_id: Option<EntityId>) -> Result<RowSet<Owned<AgentItem>>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .agents
            .values()
            .filter(|(owner, _)| cluster_id.map_or(true, |id| *owner == id.get()))
            .map(|(owner, agent)| {
                Ok(Owned {
                    cluster_name: tables.clusters.get(owner).cloned().unwrap_or_default(),
                    item: agent.clone(),
                })
            })
            .collect())
    }

    async fn nodes(&self, cluster_id: Option<EntityId>) -> Result<RowSet<Owned<NodeItem>>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .nodes
            .values()
            .filter(|(owner, _)| cluster_id.map_or(true, |id| *owner == id.get()))
            .map(|(owner, node)| {
                Ok(Owned {
                    cluster_name: tables.clusters.get(owner).cloned().unwrap_or_default(),
                    item: node.clone(),
                })
            })
            .collect())
    }

    async fn metric_names(&self) -> Result<RowSet<MetricNameItem>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        Ok(tables.metric_names.values().cloned().map(Ok).collect())
    }

    async fn metric_ids(&self, names: &[String]) -> Result<Vec<i64>> {
        self.check_available().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .metric_names
            .values()
            .filter(|m| names.contains(&m.name))
            .map(|m| m.id)
            .collect())
    }

    async fn snapshot(&self, plan: &SnapshotPlan) -> Result<RowSet<SnapshotRow>> {
        self.check_available().await?;
        Ok(self.tables.read().await.snapshot(plan))
    }

    async fn series(&self, plan: &SeriesPlan) -> Result<RowSet<SeriesRow>> {
        self.check_available().await?;
        Ok(self.tables.read().await.series(plan))
    }

    async fn summary(&self, plan: &SummaryPlan) -> Result<RowSet<RollupRow>> {
        self.check_available().await?;
        Ok(self.tables.read().await.summary(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::granularity::plan as plan_window;
    use chrono::{Duration, TimeZone};
    use chrono_tz::Tz;

    fn id(raw: i64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    fn node(id: i64, host: &str) -> NodeItem {
        NodeItem {
            id,
            host: host.into(),
            ip: "10.0.0.1".into(),
            os: "linux".into(),
            platform: "ubuntu".into(),
            platform_family: "debian".into(),
            platform_version: "22.04".into(),
            agent_id: id,
        }
    }

    async fn fixture() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_cluster(1, "prod", true).await;
        store.add_node(1, node(1, "node-a")).await;
        store.add_node(1, node(2, "node-b")).await;
        store.add_process(10, "nginx").await;
        store.add_container(20, "api", "c-api").await;
        store.add_container(21, "sidecar", "c-sidecar").await;
        store.add_container(22, "orphan", "c-orphan").await;
        store.add_namespace(30, "default").await;
        store.add_pod(40, 30, "api-7d9").await;
        store.link_container("c-api", 40).await;
        store.link_container("c-sidecar", 40).await;
        store.add_metric_name(1, "cpu", "cpu usage", "gauge").await;
        store.add_metric_name(2, "memory", "memory usage", "gauge").await;
        store.add_label(1, "total").await;
        store.add_label(2, "core0").await;
        store
    }

    #[tokio::test]
    async fn test_snapshot_keeps_latest_per_series() {
        let store = fixture().await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(11, 59, 10), 10.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(11, 59, 40), 20.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 2, at(11, 59, 30), 5.0)).await;
        // Outside the 60s window
        store.insert(MetricSample::new(1, 2, 1, 1, at(11, 58, 0), 99.0)).await;

        let plan = SnapshotPlan::new(Scope::cluster(id(1)), QueryLevel::Node, MetricFilter::all(), at(12, 0, 0));
        let rows: Vec<_> = store.snapshot(&plan).await.unwrap().into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].metric_label.as_deref(), Some("core0"));
        assert_eq!(rows[1].value, 20.0);
        assert_eq!(rows[1].ts, at(11, 59, 40));
        assert!(rows.iter().all(|r| r.entity.name() == "node-a"));
    }

    #[tokio::test]
    async fn test_level_sentinels_separate_rows() {
        let store = fixture().await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(11, 59, 30), 1.0)).await;
        store
            .insert(MetricSample::new(1, 1, 1, 1, at(11, 59, 30), 2.0).with_process(10))
            .await;

        let scope = Scope::cluster(id(1)).with_node(id(1));
        let plan = SnapshotPlan::new(scope, QueryLevel::Process, MetricFilter::all(), at(12, 0, 0));
        let rows = store.snapshot(&plan).await.unwrap();

        assert_eq!(rows.len(), 1);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.entity.name(), "nginx");
        assert_eq!(row.value, 2.0);
    }

    #[tokio::test]
    async fn test_pod_snapshot_sums_linked_containers() {
        let store = fixture().await;
        for (container, value) in [(20, 1.25), (21, 2.5), (22, 100.0)] {
            store
                .insert(MetricSample::new(1, 1, 2, 1, at(11, 59, 50), value).with_container(container))
                .await;
        }

        let plan = SnapshotPlan::new(Scope::cluster(id(1)), QueryLevel::Pod, MetricFilter::new(vec![2]), at(12, 0, 0));
        let rows = store.snapshot(&plan).await.unwrap();

        assert_eq!(rows.len(), 1);
        let row = rows[0].as_ref().unwrap();
        assert_eq!(row.value, 3.75);
        assert_eq!(row.metric_label, None);
        assert!(matches!(&row.entity, EntityRef::Pod { namespace, .. } if namespace == "default"));
    }

    #[tokio::test]
    async fn test_series_averages_per_bucket() {
        let store = fixture().await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(0, 0, 10), 1.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(0, 0, 50), 2.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(0, 1, 5), 4.0)).await;
        // End bound is exclusive
        store.insert(MetricSample::new(1, 1, 1, 1, at(1, 0, 0), 8.0)).await;

        let window = plan_window(
            &["2024-01-01 00:00:00".into(), "2024-01-01 01:00:00".into()],
            Tz::UTC,
            None,
        )
        .unwrap();
        let plan = SeriesPlan::new(Scope::cluster(id(1)), QueryLevel::Node, MetricFilter::all(), window);
        let rows: Vec<_> = store.series(&plan).await.unwrap().into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].bucket.to_string(), "2024-01-01 00:00:00");
        assert_eq!(rows[0].value, 1.5);
        assert_eq!(rows[1].bucket.to_string(), "2024-01-01 00:01:00");
        assert_eq!(rows[1].value, 4.0);
    }

    #[tokio::test]
    async fn test_cluster_series_sums_across_nodes() {
        let store = fixture().await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(0, 0, 10), 1.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(0, 0, 20), 3.0)).await;
        store.insert(MetricSample::new(1, 2, 1, 1, at(0, 0, 30), 5.0)).await;

        let window = plan_window(
            &["2024-01-01 00:00:00".into(), "2024-01-01 01:00:00".into()],
            Tz::UTC,
            Some("hour"),
        )
        .unwrap();
        let plan = SeriesPlan::new(Scope::cluster(id(1)), QueryLevel::Cluster, MetricFilter::all(), window);
        let rows = store.series(&plan).await.unwrap();

        assert_eq!(rows.len(), 1);
        // mean(node-a) + mean(node-b)
        assert_eq!(rows[0].as_ref().unwrap().value, 7.0);
    }

    #[tokio::test]
    async fn test_pod_series_sums_container_means_within_namespace() {
        let store = fixture().await;
        store.add_namespace(31, "kube-system").await;
        store.add_pod(41, 31, "dns").await;
        store.link_container("c-orphan", 41).await;

        for (container, minute, value) in [(20, 10, 1.0), (20, 20, 3.0), (21, 15, 5.0), (22, 15, 100.0)] {
            store
                .insert(MetricSample::new(1, 1, 1, 1, at(0, minute, 0), value).with_container(container))
                .await;
        }

        let window = plan_window(
            &["2024-01-01 00:00:00".into(), "2024-01-01 01:00:00".into()],
            Tz::UTC,
            Some("hour"),
        )
        .unwrap();
        let scope = Scope {
            namespace_id: Some(id(30)),
            ..Scope::cluster(id(1))
        };
        let plan = SeriesPlan::new(scope, QueryLevel::Pod, MetricFilter::all(), window);
        let rows: Vec<_> = store.series(&plan).await.unwrap().into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity.name(), "api-7d9");
        // mean(api) + mean(sidecar); the kube-system pod is filtered out
        assert_eq!(rows[0].value, 7.0);
        assert_eq!(rows[0].metric_label, None);
    }

    #[tokio::test]
    async fn test_latency_delays_calls() {
        let store = fixture().await;
        store.set_latency(StdDuration::from_millis(50));

        let started = std::time::Instant::now();
        store.ping().await.unwrap();
        assert!(started.elapsed() >= StdDuration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dangling_reference_becomes_row_error() {
        let store = fixture().await;
        store.insert(MetricSample::new(1, 1, 1, 1, at(11, 59, 30), 1.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 77, at(11, 59, 30), 1.0)).await;
        store.insert(MetricSample::new(1, 2, 1, 1, at(11, 59, 30), 1.0)).await;

        let plan = SnapshotPlan::new(Scope::cluster(id(1)), QueryLevel::Node, MetricFilter::all(), at(12, 0, 0));
        let rows = store.snapshot(&plan).await.unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows[0].is_ok());
        assert!(rows[1].is_ok());
        assert!(matches!(
            rows[2],
            Err(RowError::MissingReference { table: "metric_labels", id: 77 })
        ));
    }

    #[tokio::test]
    async fn test_summary_groups_latest_node_values() {
        let store = fixture().await;
        let now = at(12, 0, 0);
        store.insert(MetricSample::new(1, 1, 1, 1, now - Duration::seconds(40), 9.0)).await;
        store.insert(MetricSample::new(1, 1, 1, 1, now - Duration::seconds(10), 1.5)).await;
        store.insert(MetricSample::new(1, 2, 1, 1, now - Duration::seconds(10), 2.5)).await;
        store
            .insert(MetricSample::new(1, 2, 1, 1, now - Duration::seconds(10), 50.0).with_process(10))
            .await;

        let by_cluster = store.summary(&SummaryPlan::clusters(None, now)).await.unwrap();
        assert_eq!(by_cluster.len(), 1);
        let row = by_cluster[0].as_ref().unwrap();
        assert_eq!((row.group_name.as_str(), row.value), ("prod", 4.0));

        let by_node = store.summary(&SummaryPlan::nodes(id(1), Some(id(2)), now)).await.unwrap();
        assert_eq!(by_node.len(), 1);
        assert_eq!(by_node[0].as_ref().unwrap().group_name, "node-b");
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = fixture().await;
        store.set_unavailable(true);

        assert!(store.ping().await.is_err());
        assert!(matches!(store.clusters().await, Err(QueryError::Backend(_))));

        store.set_unavailable(false);
        assert_eq!(store.clusters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listings_carry_cluster_name() {
        let store = fixture().await;
        store.add_node(5, node(9, "stray")).await;

        let nodes = store.nodes(Some(id(1))).await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].as_ref().unwrap().cluster_name, "prod");

        let all = store.nodes(None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].as_ref().unwrap().cluster_name, "");
    }
}
