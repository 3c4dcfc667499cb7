//! Latest-value rollups per cluster or per node

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, Envelope, Rollup};
use crate::output::{format_value, print_json, print_query_time, print_rows, OutputFormat};

#[derive(Tabled)]
struct RollupRow {
    #[tabled(rename = "Group")]
    group: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Value")]
    value: String,
}

pub fn clusters_path(cluster: Option<&str>) -> String {
    match cluster {
        Some(id) => format!("api/v1/summary/clusters/{}", id),
        None => "api/v1/summary/clusters".to_string(),
    }
}

pub fn nodes_path(cluster: &str, node: Option<&str>) -> String {
    match node {
        Some(id) => format!("api/v1/summary/clusters/{}/nodes/{}", cluster, id),
        None => format!("api/v1/summary/clusters/{}/nodes", cluster),
    }
}

/// Fetch a rollup and print it as `group / metric / value` rows
pub async fn show_rollup(client: &ApiClient, path: &str, format: OutputFormat) -> Result<()> {
    let envelope: Envelope<Rollup> = client.get(path, &[]).await?;
    let rollup = envelope.data.unwrap_or_default();

    match format {
        OutputFormat::Json => print_json(&rollup)?,
        OutputFormat::Table => {
            let rows: Vec<RollupRow> = rollup
                .into_iter()
                .flat_map(|(group, metrics)| {
                    metrics.into_iter().map(move |(metric, value)| RollupRow {
                        group: group.clone(),
                        metric,
                        value: format_value(value),
                    })
                })
                .collect();
            print_rows(rows, "No recent samples to summarize");
            print_query_time(envelope.db_query_time.as_deref());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollup_paths() {
        assert_eq!(clusters_path(None), "api/v1/summary/clusters");
        assert_eq!(clusters_path(Some("2")), "api/v1/summary/clusters/2");
        assert_eq!(nodes_path("2", None), "api/v1/summary/clusters/2/nodes");
        assert_eq!(nodes_path("2", Some("7")), "api/v1/summary/clusters/2/nodes/7");
    }

    #[tokio::test]
    async fn test_rollup_is_fetched() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/summary/clusters/2/nodes")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"ok","message":"","data":{"node-a":{"cpu":1.5}},"db_query_time":"3ms"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        show_rollup(&client, &nodes_path("2", None), OutputFormat::Json)
            .await
            .unwrap();

        mock.assert_async().await;
    }
}
