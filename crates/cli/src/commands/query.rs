//! Snapshot and series queries

use anyhow::{bail, Result};
use clap::Subcommand;
use tabled::Tabled;

use crate::client::{ApiClient, Envelope, Grouped, Row};
use crate::output::{format_cell, print_json, print_query_time, print_rows, OutputFormat};

/// Entity tree a query is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Target {
    /// Node metrics of a cluster
    Nodes {
        cluster: String,
        #[arg(long)]
        node: Option<String>,
    },

    /// Process metrics of a node
    Processes {
        cluster: String,
        #[arg(long)]
        node: String,
        #[arg(long)]
        process: Option<String>,
    },

    /// Container metrics of a node
    Containers {
        cluster: String,
        #[arg(long)]
        node: String,
        #[arg(long)]
        container: Option<String>,
    },

    /// Kubernetes pod metrics of a cluster
    Pods {
        cluster: String,
        #[arg(long)]
        namespace: Option<String>,
        #[arg(long, requires = "namespace")]
        pod: Option<String>,
    },

    /// Cluster-wide rollup (series only)
    Summary { cluster: String },
}

impl Target {
    /// Path below the `snapshot` or `metrics` tree
    pub fn path(&self) -> String {
        match self {
            Target::Nodes { cluster, node } => match node {
                Some(node) => format!("{}/nodes/{}", cluster, node),
                None => format!("{}/nodes", cluster),
            },
            Target::Processes { cluster, node, process } => match process {
                Some(process) => format!("{}/nodes/{}/processes/{}", cluster, node, process),
                None => format!("{}/nodes/{}/processes", cluster, node),
            },
            Target::Containers { cluster, node, container } => match container {
                Some(container) => format!("{}/nodes/{}/containers/{}", cluster, node, container),
                None => format!("{}/nodes/{}/containers", cluster, node),
            },
            Target::Pods { cluster, namespace, pod } => match (namespace, pod) {
                (Some(ns), Some(pod)) => format!("{}/k8s/namespaces/{}/pods/{}", cluster, ns, pod),
                (Some(ns), None) => format!("{}/k8s/namespaces/{}/pods", cluster, ns),
                _ => format!("{}/k8s/pods", cluster),
            },
            Target::Summary { cluster } => format!("{}/summary", cluster),
        }
    }
}

/// Query-string parameters shared by both modes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub metrics: Vec<String>,
    pub timezone: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub granularity: Option<String>,
}

impl QueryOptions {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs: Vec<(&'static str, String)> =
            self.metrics.iter().map(|m| ("metricNames", m.clone())).collect();
        if let Some(tz) = &self.timezone {
            pairs.push(("timezone", tz.clone()));
        }
        if let (Some(from), Some(to)) = (&self.from, &self.to) {
            pairs.push(("dateRange", from.clone()));
            pairs.push(("dateRange", to.clone()));
        }
        if let Some(granularity) = &self.granularity {
            pairs.push(("granularity", granularity.clone()));
        }
        pairs
    }
}

#[derive(Tabled)]
struct SnapshotTableRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Timestamp")]
    ts: String,
}

#[derive(Tabled)]
struct SeriesTableRow {
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Bucket")]
    bucket: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Latest value per series
pub async fn snapshot(
    client: &ApiClient,
    target: &Target,
    options: &QueryOptions,
    format: OutputFormat,
) -> Result<()> {
    if matches!(target, Target::Summary { .. }) {
        bail!("cluster summary is only available as a series");
    }

    let path = format!("api/v1/snapshot/{}", target.path());
    let envelope: Envelope<Grouped<Row>> = client.get(&path, &options.to_pairs()).await?;
    let groups = envelope.data.unwrap_or_default();

    match format {
        OutputFormat::Json => print_json(&groups)?,
        OutputFormat::Table => {
            let rows: Vec<SnapshotTableRow> = groups
                .into_iter()
                .flat_map(|(entity, rows)| {
                    rows.into_iter().map(move |row| SnapshotTableRow {
                        entity: entity.clone(),
                        metric: format_cell(row.get("metric_name")),
                        label: format_cell(row.get("metric_label")),
                        value: format_cell(row.get("value")),
                        ts: format_cell(row.get("ts")),
                    })
                })
                .collect();
            print_rows(rows, "No samples in the snapshot window");
            print_query_time(envelope.db_query_time.as_deref());
        }
    }

    Ok(())
}

/// Bucketed series over a date range
pub async fn series(
    client: &ApiClient,
    target: &Target,
    options: &QueryOptions,
    format: OutputFormat,
) -> Result<()> {
    if options.from.is_none() || options.to.is_none() {
        bail!("series queries need both --from and --to");
    }
    if options.metrics.is_empty() {
        bail!("series queries need at least one --metric");
    }

    let path = format!("api/v1/metrics/{}", target.path());
    let pairs = options.to_pairs();

    // The cluster rollup answers with a flat list instead of groups
    let (groups, db_query_time) = if matches!(target, Target::Summary { .. }) {
        let envelope: Envelope<Vec<Row>> = client.get(&path, &pairs).await?;
        let mut groups = Grouped::new();
        groups.insert(String::new(), envelope.data.unwrap_or_default());
        (groups, envelope.db_query_time)
    } else {
        let envelope: Envelope<Grouped<Row>> = client.get(&path, &pairs).await?;
        (envelope.data.unwrap_or_default(), envelope.db_query_time)
    };

    match format {
        OutputFormat::Json => print_json(&groups)?,
        OutputFormat::Table => {
            let rows: Vec<SeriesTableRow> = groups
                .into_iter()
                .flat_map(|(entity, rows)| {
                    rows.into_iter().map(move |row| SeriesTableRow {
                        entity: if entity.is_empty() { "cluster".to_string() } else { entity.clone() },
                        bucket: format_cell(row.get("bucket")),
                        metric: format_cell(row.get("metric_name")),
                        label: format_cell(row.get("metric_label")),
                        value: format_cell(row.get("value")),
                    })
                })
                .collect();
            print_rows(rows, "No samples in the requested range");
            print_query_time(db_query_time.as_deref());
        }
    }

    Ok(())
}
