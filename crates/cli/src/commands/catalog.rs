//! Catalog and service-state commands: clusters, agents, nodes, metric
//! names, status, health and incidents

use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::{Agent, ApiClient, ByCluster, Cluster, Envelope, Incident, MetricName, Node, Status};
use crate::output::{
    color_flag, color_online, format_value, print_json, print_query_time, print_rows,
    print_success, OutputFormat,
};

#[derive(Tabled)]
struct ClusterRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Kubernetes")]
    kubernetes: String,
}

#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "State")]
    state: String,
}

#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "Cluster")]
    cluster: String,
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "IP")]
    ip: String,
    #[tabled(rename = "Platform")]
    platform: String,
    #[tabled(rename = "Agent")]
    agent_id: i64,
}

#[derive(Tabled)]
struct MetricNameRow {
    #[tabled(rename = "ID")]
    id: i64,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    metric_type: String,
    #[tabled(rename = "Help")]
    help: String,
}

#[derive(Tabled)]
struct IncidentRow {
    #[tabled(rename = "Detected")]
    detected: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Cluster")]
    cluster_id: i64,
    #[tabled(rename = "Node")]
    node_id: String,
    #[tabled(rename = "Target")]
    target: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Message")]
    message: String,
}

/// Listing path, optionally scoped to one cluster
pub fn listing_path(resource: &str, cluster: Option<&str>) -> String {
    match cluster {
        Some(id) => format!("api/v1/clusters/{}/{}", id, resource),
        None => format!("api/v1/{}", resource),
    }
}

pub async fn list_clusters(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let envelope: Envelope<Vec<Cluster>> = client.get("api/v1/clusters", &[]).await?;
    let clusters = envelope.data.unwrap_or_default();

    match format {
        OutputFormat::Json => print_json(&clusters)?,
        OutputFormat::Table => {
            let rows: Vec<ClusterRow> = clusters
                .into_iter()
                .map(|c| ClusterRow {
                    id: c.id,
                    name: c.name,
                    kubernetes: color_flag(c.kubernetes),
                })
                .collect();
            print_rows(rows, "No clusters found");
            print_query_time(envelope.db_query_time.as_deref());
        }
    }

    Ok(())
}

pub async fn list_agents(client: &ApiClient, cluster: Option<&str>, format: OutputFormat) -> Result<()> {
    let envelope: Envelope<ByCluster<Agent>> = client.get(&listing_path("agents", cluster), &[]).await?;
    let agents = envelope.data.unwrap_or_default();

    match format {
        OutputFormat::Json => print_json(&agents)?,
        OutputFormat::Table => {
            let rows: Vec<AgentRow> = agents
                .into_iter()
                .flat_map(|(cluster, items)| {
                    items.into_iter().map(move |a| AgentRow {
                        cluster: cluster.clone(),
                        id: a.id,
                        version: a.version,
                        ip: a.ip,
                        state: color_online(a.online),
                    })
                })
                .collect();
            print_rows(rows, "No agents found");
            print_query_time(envelope.db_query_time.as_deref());
        }
    }

    Ok(())
}

pub async fn list_nodes(client: &ApiClient, cluster: Option<&str>, format: OutputFormat) -> Result<()> {
    let envelope: Envelope<ByCluster<Node>> = client.get(&listing_path("nodes", cluster), &[]).await?;
    let nodes = envelope.data.unwrap_or_default();

    match format {
        OutputFormat::Json => print_json(&nodes)?,
        OutputFormat::Table => {
            let rows: Vec<NodeRow> = nodes
                .into_iter()
                .flat_map(|(cluster, items)| {
                    items.into_iter().map(move |n| NodeRow {
                        cluster: cluster.clone(),
                        id: n.id,
                        host: n.host,
                        ip: n.ip,
                        platform: format!("{} {} ({})", n.platform, n.platform_version, n.os),
                        agent_id: n.agent_id,
                    })
                })
                .collect();
            print_rows(rows, "No nodes found");
            print_query_time(envelope.db_query_time.as_deref());
        }
    }

    Ok(())
}

pub async fn list_metric_names(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let names: Vec<MetricName> = client.get_data("api/v1/metric_names", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&names)?,
        OutputFormat::Table => {
            let rows: Vec<MetricNameRow> = names
                .into_iter()
                .map(|m| MetricNameRow {
                    id: m.id,
                    name: m.name,
                    metric_type: m.metric_type,
                    help: m.help,
                })
                .collect();
            print_rows(rows, "No metric names registered");
        }
    }

    Ok(())
}

pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: Status = client.get_data("api/v1/status", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("{}", "Ingest Status".bold());
            println!("{}", "=".repeat(40));
            println!("Uptime:              {}", status.uptime.cyan());
            println!("Metrics per second:  {}", status.metrics_per_seconds);
            println!("Total metrics:       {}", status.total_metrics);
        }
    }

    Ok(())
}

/// Check server and store health; any failure surfaces as an error
pub async fn check_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let envelope: Envelope<serde_json::Value> = client.get("api/v1/health", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&envelope)?,
        OutputFormat::Table => print_success("Query service and metrics store are reachable"),
    }

    Ok(())
}

pub async fn list_incidents(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let incidents: Vec<Incident> = client.get_data("api/v1/incidents/basic", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&incidents)?,
        OutputFormat::Table => {
            let rows: Vec<IncidentRow> = incidents
                .into_iter()
                .map(|i| IncidentRow {
                    detected: i.detected_ts,
                    name: i.name.red().to_string(),
                    cluster_id: i.cluster_id,
                    node_id: i.node_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string()),
                    target: i.target,
                    value: format_value(i.value),
                    message: i.message,
                })
                .collect();
            print_rows(rows, "No open incidents");
        }
    }

    Ok(())
}
