//! PostgreSQL metrics store
//!
//! Renders plans with `sqlx::QueryBuilder`. Every value that originates in a
//! request (ids, metric ids, time bounds, timezone, bucket width) is pushed
//! as a bind parameter; only fixed fragments chosen from enums are pushed as
//! SQL text.

use super::{async_trait, MetricStore, RowSet};
use crate::error::{Result, RowError};
use crate::granularity::{BucketKind, BucketRule, BucketWidth};
use crate::models::{
    AgentItem, ClusterItem, EntityRef, MetricNameItem, NodeItem, Owned, RollupRow, SeriesRow,
    SnapshotRow,
};
use crate::plan::{MetricFilter, SeriesPlan, SnapshotPlan, SummaryGrouping, SummaryPlan};
use crate::scope::{EntityId, EntityLevel, QueryLevel, Scope};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::{QueryBuilder, Row};
use tracing::debug;

/// Columns identifying one series in the fact table
const SERIES_KEY: &str = "m.node_id, m.process_id, m.container_id, m.name_id, m.label_id";

/// Entity columns, joins and ordering for one query level
///
/// Fragments refer to the aggregated subquery as `src`.
struct EntitySql {
    columns: &'static str,
    joins: &'static str,
    group: &'static str,
    order: &'static str,
}

fn entity_sql(level: QueryLevel) -> EntitySql {
    match level {
        QueryLevel::Node => EntitySql {
            columns: "nodes.id::bigint AS entity_id, nodes.host AS entity_name, ",
            joins: " JOIN nodes ON nodes.id = src.node_id",
            group: "nodes.id, nodes.host, ",
            order: "nodes.id, ",
        },
        QueryLevel::Process => EntitySql {
            columns: "processes.id::bigint AS entity_id, processes.name AS entity_name, ",
            joins: " JOIN processes ON processes.id = src.process_id",
            group: "processes.id, processes.name, ",
            order: "processes.id, ",
        },
        QueryLevel::Container => EntitySql {
            columns: "containers.id::bigint AS entity_id, containers.name AS entity_name, ",
            joins: " JOIN containers ON containers.id = src.container_id",
            group: "containers.id, containers.name, ",
            order: "containers.id, ",
        },
        QueryLevel::Pod => EntitySql {
            columns: "k8s_pods.id::bigint AS entity_id, k8s_pods.name AS entity_name, \
                      k8s_namespaces.name AS namespace, ",
            joins: " JOIN containers ON containers.id = src.container_id \
                     JOIN k8s_containers ON k8s_containers.container_id = containers.container_id \
                     JOIN k8s_pods ON k8s_pods.id = k8s_containers.k8s_pod_id \
                     JOIN k8s_namespaces ON k8s_namespaces.id = k8s_pods.k8s_namespace_id",
            group: "k8s_pods.id, k8s_pods.name, k8s_namespaces.name, ",
            order: "k8s_pods.name, k8s_pods.id, ",
        },
        QueryLevel::Cluster => EntitySql {
            columns: "",
            joins: "",
            group: "",
            order: "",
        },
    }
}

fn push_level_filter(qb: &mut QueryBuilder<'static, Postgres>, level: EntityLevel) {
    qb.push(match level {
        EntityLevel::Node => " AND m.process_id = 0 AND m.container_id = 0",
        EntityLevel::Process => " AND m.process_id <> 0 AND m.container_id = 0",
        EntityLevel::Container => " AND m.process_id = 0 AND m.container_id <> 0",
    });
}

fn push_scope_filter(qb: &mut QueryBuilder<'static, Postgres>, scope: &Scope) {
    qb.push(" AND m.cluster_id = ").push_bind(scope.cluster_id.get());
    if let Some(node_id) = scope.node_id {
        qb.push(" AND m.node_id = ").push_bind(node_id.get());
    }
    if let Some(process_id) = scope.process_id {
        qb.push(" AND m.process_id = ").push_bind(process_id.get());
    }
    if let Some(container_id) = scope.container_id {
        qb.push(" AND m.container_id = ").push_bind(container_id.get());
    }
}

fn push_metric_filter(qb: &mut QueryBuilder<'static, Postgres>, metrics: &MetricFilter) {
    if !metrics.is_empty() {
        qb.push(" AND m.name_id = ANY(")
            .push_bind(metrics.ids().to_vec())
            .push(")");
    }
}

/// Kubernetes filters apply to the joined tables, outside the subquery
fn push_pod_filter(qb: &mut QueryBuilder<'static, Postgres>, scope: &Scope) {
    qb.push(" WHERE TRUE");
    if let Some(namespace_id) = scope.namespace_id {
        qb.push(" AND k8s_namespaces.id = ").push_bind(namespace_id.get());
    }
    if let Some(pod_id) = scope.pod_id {
        qb.push(" AND k8s_pods.id = ").push_bind(pod_id.get());
    }
}

/// Sample timestamp on the wall clock of the rule's timezone
fn push_local_ts(qb: &mut QueryBuilder<'static, Postgres>, rule: &BucketRule) {
    qb.push("(m.ts AT TIME ZONE ")
        .push_bind(rule.timezone.name().to_string())
        .push(")");
}

fn push_bucket_expr(qb: &mut QueryBuilder<'static, Postgres>, rule: &BucketRule) {
    match rule.kind {
        BucketKind::Truncate(unit) => {
            qb.push("DATE_TRUNC('").push(unit.as_str()).push("', ");
            push_local_ts(qb, rule);
            qb.push(")");
        }
        BucketKind::Step(width) => {
            let (align, part, step) = match width {
                BucketWidth::Minutes(_) => ("hour", "minute", "1 minute"),
                BucketWidth::Hours(_) => ("day", "hour", "1 hour"),
                BucketWidth::Days(_) => ("month", "day", "1 day"),
            };
            let w = width.width().max(1) as i32;

            qb.push("DATE_TRUNC('").push(align).push("', ");
            push_local_ts(qb, rule);
            qb.push(") + (DATE_PART('").push(part).push("', ");
            push_local_ts(qb, rule);
            qb.push(")::int / ")
                .push_bind(w)
                .push(") * ")
                .push_bind(w)
                .push(" * INTERVAL '")
                .push(step)
                .push("'");
        }
    }
}

/// Latest row per series, then joined (and summed for rollups)
pub fn snapshot_query(plan: &SnapshotPlan) -> QueryBuilder<'static, Postgres> {
    let entity = entity_sql(plan.level);
    let rollup = plan.level.is_rollup();
    let mut qb = QueryBuilder::new("SELECT ");

    qb.push(entity.columns);
    if rollup {
        qb.push("MAX(src.ts) AS ts, ROUND(SUM(src.value)::numeric, 2)::float8 AS value, ");
    } else {
        qb.push("src.ts AS ts, ROUND(src.value::numeric, 2)::float8 AS value, ");
    }
    qb.push("metric_names.name AS metric_name");
    if !rollup {
        qb.push(", metric_labels.label AS metric_label");
    }

    qb.push(" FROM (SELECT DISTINCT ON (")
        .push(SERIES_KEY)
        .push(") ")
        .push(SERIES_KEY)
        .push(", m.ts, m.value FROM metrics m WHERE m.ts >= ")
        .push_bind(plan.since);
    push_scope_filter(&mut qb, &plan.scope);
    push_level_filter(&mut qb, plan.row_level());
    push_metric_filter(&mut qb, &plan.metrics);
    qb.push(" ORDER BY ").push(SERIES_KEY).push(", m.ts DESC) src");

    qb.push(entity.joins)
        .push(" JOIN metric_names ON metric_names.id = src.name_id");
    if !rollup {
        qb.push(" JOIN metric_labels ON metric_labels.id = src.label_id");
    }
    push_pod_filter(&mut qb, &plan.scope);

    if rollup {
        qb.push(" GROUP BY ")
            .push(entity.group)
            .push("metric_names.name ORDER BY ")
            .push(entity.order)
            .push("metric_names.name");
    } else {
        qb.push(" ORDER BY ")
            .push(entity.order)
            .push("metric_names.name, metric_labels.label");
    }

    qb
}

/// Mean per series and bucket, then joined (and summed for rollups)
pub fn series_query(plan: &SeriesPlan) -> QueryBuilder<'static, Postgres> {
    let entity = entity_sql(plan.level);
    let rollup = plan.level.is_rollup();
    let mut qb = QueryBuilder::new("SELECT ");

    qb.push(entity.columns)
        .push(if rollup {
            "ROUND(SUM(src.value)::numeric, 2)::float8 AS value, "
        } else {
            "ROUND(AVG(src.value)::numeric, 2)::float8 AS value, "
        })
        .push("src.bucket AS bucket, metric_names.name AS metric_name");
    if !rollup {
        qb.push(", metric_labels.label AS metric_label");
    }

    qb.push(" FROM (SELECT ")
        .push(SERIES_KEY)
        .push(", AVG(m.value) AS value, ");
    push_bucket_expr(&mut qb, plan.rule());
    qb.push(" AS bucket FROM metrics m WHERE m.ts >= ")
        .push_bind(plan.range().start)
        .push(" AND m.ts < ")
        .push_bind(plan.range().end);
    push_scope_filter(&mut qb, &plan.scope);
    push_level_filter(&mut qb, plan.level.row_level());
    push_metric_filter(&mut qb, &plan.metrics);
    qb.push(" GROUP BY bucket, ").push(SERIES_KEY).push(") src");

    qb.push(entity.joins)
        .push(" JOIN metric_names ON metric_names.id = src.name_id");
    if !rollup {
        qb.push(" JOIN metric_labels ON metric_labels.id = src.label_id");
    }
    push_pod_filter(&mut qb, &plan.scope);

    let label = if rollup { "" } else { ", metric_labels.label" };
    qb.push(" GROUP BY src.bucket, ")
        .push(entity.group)
        .push("metric_names.name")
        .push(label)
        .push(" ORDER BY src.bucket, ")
        .push(entity.order)
        .push("metric_names.name")
        .push(label);

    qb
}

/// Latest node-level values summed per cluster or node
pub fn summary_query(plan: &SummaryPlan) -> QueryBuilder<'static, Postgres> {
    let (group_cols, join, order) = match plan.grouping {
        SummaryGrouping::Cluster => (
            "clusters.id::bigint AS group_id, clusters.name AS group_name, ",
            " JOIN clusters ON clusters.id = src.cluster_id",
            "clusters.id, clusters.name",
        ),
        SummaryGrouping::Node => (
            "nodes.id::bigint AS group_id, nodes.host AS group_name, ",
            " JOIN nodes ON nodes.id = src.node_id",
            "nodes.id, nodes.host",
        ),
    };

    let mut qb = QueryBuilder::new("SELECT ");
    qb.push(group_cols)
        .push("metric_names.name AS metric_name, ROUND(SUM(src.value)::numeric, 2)::float8 AS value")
        .push(" FROM (SELECT DISTINCT ON (m.node_id, m.name_id, m.label_id) m.cluster_id, m.node_id, m.name_id, m.value")
        .push(" FROM metrics m WHERE m.ts >= ")
        .push_bind(plan.since);
    push_level_filter(&mut qb, EntityLevel::Node);
    if let Some(cluster_id) = plan.cluster_id {
        qb.push(" AND m.cluster_id = ").push_bind(cluster_id.get());
    }
    if let Some(node_id) = plan.node_id {
        qb.push(" AND m.node_id = ").push_bind(node_id.get());
    }
    qb.push(" ORDER BY m.node_id, m.name_id, m.label_id, m.ts DESC) src")
        .push(join)
        .push(" JOIN metric_names ON metric_names.id = src.name_id GROUP BY ")
        .push(order)
        .push(", metric_names.name ORDER BY ")
        .push(order)
        .push(", metric_names.name");

    qb
}

fn decode_entity(level: QueryLevel, row: &PgRow) -> std::result::Result<EntityRef, RowError> {
    Ok(match level {
        QueryLevel::Node => EntityRef::Node {
            id: row.try_get("entity_id")?,
            host: row.try_get("entity_name")?,
        },
        QueryLevel::Process => EntityRef::Process {
            id: row.try_get("entity_id")?,
            name: row.try_get("entity_name")?,
        },
        QueryLevel::Container => EntityRef::Container {
            id: row.try_get("entity_id")?,
            name: row.try_get("entity_name")?,
        },
        QueryLevel::Pod => EntityRef::Pod {
            id: row.try_get("entity_id")?,
            name: row.try_get("entity_name")?,
            namespace: row.try_get("namespace")?,
        },
        QueryLevel::Cluster => EntityRef::Cluster,
    })
}

fn decode_label(level: QueryLevel, row: &PgRow) -> std::result::Result<Option<String>, RowError> {
    if level.is_rollup() {
        Ok(None)
    } else {
        Ok(Some(row.try_get("metric_label")?))
    }
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool without connecting; connections open on first use
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    async fn fetch(&self, mut qb: QueryBuilder<'static, Postgres>) -> Result<Vec<PgRow>> {
        debug!(sql = %qb.sql(), "Executing query");
        Ok(qb.build().fetch_all(&self.pool).await?)
    }
}

#[async_trait]
impl MetricStore for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn clusters(&self) -> Result<RowSet<ClusterItem>> {
        let qb = QueryBuilder::new(
            "SELECT clusters.id::bigint AS id, clusters.name AS name, \
             EXISTS (SELECT 1 FROM k8s_clusters WHERE k8s_clusters.agent_cluster_id = clusters.id) AS kubernetes \
             FROM clusters ORDER BY clusters.id",
        );
        let rows = self.fetch(qb).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(ClusterItem {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    kubernetes: row.try_get("kubernetes")?,
                })
            })
            .collect())
    }

    async fn agents(&self, cluster_id: Option<EntityId>) -> Result<RowSet<Owned<AgentItem>>> {
        let mut qb = QueryBuilder::new(
            "SELECT agents.id::bigint AS id, agents.version AS version, agents.ipv4 AS ip, \
             agents.online AS online, COALESCE(clusters.name, '') AS cluster_name \
             FROM agents LEFT JOIN clusters ON agents.cluster_id = clusters.id",
        );
        if let Some(cluster_id) = cluster_id {
            qb.push(" WHERE agents.cluster_id = ").push_bind(cluster_id.get());
        }
        qb.push(" ORDER BY agents.id");
        let rows = self.fetch(qb).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(Owned {
                    cluster_name: row.try_get("cluster_name")?,
                    item: AgentItem {
                        id: row.try_get("id")?,
                        version: row.try_get("version")?,
                        ip: row.try_get("ip")?,
                        online: row.try_get("online")?,
                    },
                })
            })
            .collect())
    }

    async fn nodes(&self, cluster_id: Option<EntityId>) -> Result<RowSet<Owned<NodeItem>>> {
        let mut qb = QueryBuilder::new(
            "SELECT nodes.id::bigint AS id, nodes.host AS host, nodes.ipv4 AS ip, nodes.os AS os, \
             nodes.platform AS platform, nodes.platform_family AS platform_family, \
             nodes.platform_version AS platform_version, nodes.agent_id::bigint AS agent_id, \
             COALESCE(clusters.name, '') AS cluster_name \
             FROM nodes LEFT JOIN clusters ON nodes.cluster_id = clusters.id",
        );
        if let Some(cluster_id) = cluster_id {
            qb.push(" WHERE nodes.cluster_id = ").push_bind(cluster_id.get());
        }
        qb.push(" ORDER BY nodes.id");
        let rows = self.fetch(qb).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(Owned {
                    cluster_name: row.try_get("cluster_name")?,
                    item: NodeItem {
                        id: row.try_get("id")?,
                        host: row.try_get("host")?,
                        ip: row.try_get("ip")?,
                        os: row.try_get("os")?,
                        platform: row.try_get("platform")?,
                        platform_family: row.try_get("platform_family")?,
                        platform_version: row.try_get("platform_version")?,
                        agent_id: row.try_get("agent_id")?,
                    },
                })
            })
            .collect())
    }

    async fn metric_names(&self) -> Result<RowSet<MetricNameItem>> {
        let qb = QueryBuilder::new(
            "SELECT metric_names.id::bigint AS id, metric_names.name AS name, \
             metric_names.help AS help, metric_types.name AS metric_type \
             FROM metric_names JOIN metric_types ON metric_names.type_id = metric_types.id \
             ORDER BY metric_names.id",
        );
        let rows = self.fetch(qb).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(MetricNameItem {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    help: row.try_get("help")?,
                    metric_type: row.try_get("metric_type")?,
                })
            })
            .collect())
    }

    async fn metric_ids(&self, names: &[String]) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id::bigint FROM metric_names WHERE name = ANY($1)",
        )
        .bind(names.to_vec())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn snapshot(&self, plan: &SnapshotPlan) -> Result<RowSet<SnapshotRow>> {
        let rows = self.fetch(snapshot_query(plan)).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(SnapshotRow {
                    entity: decode_entity(plan.level, row)?,
                    ts: row.try_get("ts")?,
                    value: row.try_get("value")?,
                    metric_name: row.try_get("metric_name")?,
                    metric_label: decode_label(plan.level, row)?,
                })
            })
            .collect())
    }

    async fn series(&self, plan: &SeriesPlan) -> Result<RowSet<SeriesRow>> {
        let rows = self.fetch(series_query(plan)).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(SeriesRow {
                    entity: decode_entity(plan.level, row)?,
                    bucket: row.try_get("bucket")?,
                    value: row.try_get("value")?,
                    metric_name: row.try_get("metric_name")?,
                    metric_label: decode_label(plan.level, row)?,
                })
            })
            .collect())
    }

    async fn summary(&self, plan: &SummaryPlan) -> Result<RowSet<RollupRow>> {
        let rows = self.fetch(summary_query(plan)).await?;

        Ok(rows
            .iter()
            .map(|row| {
                Ok(RollupRow {
                    group_id: row.try_get("group_id")?,
                    group_name: row.try_get("group_name")?,
                    metric_name: row.try_get("metric_name")?,
                    value: row.try_get("value")?,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::granularity::{plan as plan_window, TimeUnit};
    use crate::scope::EntityId;
    use chrono::{TimeZone, Utc};
    use chrono_tz::Tz;

    fn id(raw: i64) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_snapshot_query_binds_every_value() {
        let scope = Scope::cluster(id(1)).with_node(id(7));
        let plan = SnapshotPlan::new(scope, QueryLevel::Node, MetricFilter::new(vec![3, 4]), now());
        let qb = snapshot_query(&plan);
        let sql = qb.sql();

        assert!(sql.contains("DISTINCT ON (m.node_id, m.process_id, m.container_id, m.name_id, m.label_id)"));
        assert!(sql.contains("m.ts >= $1"));
        assert!(sql.contains("m.cluster_id = $2"));
        assert!(sql.contains("m.node_id = $3"));
        assert!(sql.contains("m.name_id = ANY($4)"));
        assert!(sql.contains("m.process_id = 0 AND m.container_id = 0"));
        assert!(sql.contains("metric_labels.label AS metric_label"));
        assert!(!sql.contains("SUM("));
    }

    #[test]
    fn test_pod_snapshot_sums_and_drops_labels() {
        let mut scope = Scope::cluster(id(1));
        scope.namespace_id = Some(id(2));
        scope.pod_id = Some(id(9));
        let plan = SnapshotPlan::new(scope, QueryLevel::Pod, MetricFilter::all(), now());
        let qb = snapshot_query(&plan);
        let sql = qb.sql();

        assert!(sql.contains("SUM(src.value)"));
        assert!(sql.contains("m.container_id <> 0"));
        assert!(sql.contains("k8s_namespaces.id = $3"));
        assert!(sql.contains("k8s_pods.id = $4"));
        assert!(!sql.contains("metric_labels"));
        assert!(!sql.contains("ANY("));
    }

    #[test]
    fn test_series_query_uses_bound_timezone() {
        let window = plan_window(
            &["2024-01-01 00:00:00".into(), "2024-01-01 01:00:00".into()],
            "Asia/Seoul".parse::<Tz>().unwrap(),
            Some("hour"),
        )
        .unwrap();
        assert_eq!(window.rule.kind, BucketKind::Truncate(TimeUnit::Hour));

        let plan = SeriesPlan::new(
            Scope::cluster(id(1)),
            QueryLevel::Container,
            MetricFilter::new(vec![1]),
            window,
        );
        let qb = series_query(&plan);
        let sql = qb.sql();

        assert!(sql.contains("DATE_TRUNC('hour', (m.ts AT TIME ZONE $1))"));
        assert!(sql.contains("m.ts >= $2 AND m.ts < $3"));
        assert!(sql.contains("GROUP BY bucket, "));
        assert!(sql.contains("ORDER BY src.bucket"));
        assert!(!sql.contains("Asia/Seoul"));
    }

    #[test]
    fn test_series_step_bucket_binds_width() {
        let window = plan_window(
            &["2024-01-01 00:00:00".into(), "2024-01-01 02:05:00".into()],
            Tz::UTC,
            None,
        )
        .unwrap();
        let plan = SeriesPlan::new(
            Scope::cluster(id(1)),
            QueryLevel::Cluster,
            MetricFilter::new(vec![1]),
            window,
        );
        let qb = series_query(&plan);
        let sql = qb.sql();

        assert!(sql.contains("DATE_TRUNC('hour', (m.ts AT TIME ZONE $1))"));
        assert!(sql.contains("DATE_PART('minute', (m.ts AT TIME ZONE $2))::int / $3) * $4 * INTERVAL '1 minute'"));
        assert!(sql.contains("SUM(src.value)"));
        assert!(!sql.contains("entity_id"));
    }

    #[test]
    fn test_summary_query_groups_by_node() {
        let plan = SummaryPlan::nodes(id(1), None, now());
        let qb = summary_query(&plan);
        let sql = qb.sql();

        assert!(sql.contains("nodes.host AS group_name"));
        assert!(sql.contains("m.cluster_id = $2"));
        assert!(sql.contains("GROUP BY nodes.id, nodes.host, metric_names.name"));
    }

    #[test]
    fn test_summary_query_without_cluster_has_single_bind() {
        let plan = SummaryPlan::clusters(None, now());
        let qb = summary_query(&plan);
        let sql = qb.sql();

        assert!(sql.contains("$1"));
        assert!(!sql.contains("$2"));
        assert!(sql.contains("clusters.name AS group_name"));
    }
}
