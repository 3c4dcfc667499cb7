//! API client for the metrics query service

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the query service
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request and decode the response envelope
    ///
    /// Repeated keys in `query` are sent as repeated parameters.
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Envelope<T>> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Envelope<serde_json::Value>>(&body)
                .map(|envelope| envelope.message)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response.json().await.context("Failed to parse response")
    }

    /// GET a path and return the envelope's `data`
    pub async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let envelope: Envelope<T> = self.get(path, query).await?;
        envelope
            .data
            .with_context(|| format!("Response from {} carried no data", path))
    }
}

/// Response envelope shared by every `/api/v1` endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: String,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
    pub db_query_time: Option<String>,
    pub count: Option<usize>,
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    pub kubernetes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub version: String,
    pub ip: String,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub host: String,
    pub ip: String,
    pub os: String,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
    pub agent_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricName {
    pub id: i64,
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub metric_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub uptime: String,
    pub metrics_per_seconds: String,
    pub total_metrics: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub name: String,
    pub cluster_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
    pub target: String,
    pub value: f64,
    pub message: String,
    pub detected_ts: String,
}

/// Listing grouped by cluster name
pub type ByCluster<T> = BTreeMap<String, Vec<T>>;

/// Snapshot or series rows grouped by entity name
pub type Grouped<T> = BTreeMap<String, Vec<T>>;

/// `group -> {metric -> value}`
pub type Rollup = BTreeMap<String, BTreeMap<String, f64>>;

/// A snapshot or series row; entity fields vary by endpoint
pub type Row = serde_json::Map<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_get_decodes_envelope() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/clusters")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":"ok","message":"","data":[{"id":1,"name":"prod","kubernetes":true}],"db_query_time":"1.2ms"}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let envelope: Envelope<Vec<Cluster>> = client.get("api/v1/clusters", &[]).await.unwrap();

        mock.assert_async().await;
        assert_eq!(envelope.status, "ok");
        assert_eq!(envelope.db_query_time.as_deref(), Some("1.2ms"));
        let clusters = envelope.data.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "prod");
        assert!(clusters[0].kubernetes);
    }

    #[tokio::test]
    async fn test_repeated_query_parameters_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/metrics/1/nodes")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("metricNames".into(), "cpu".into()),
                Matcher::UrlEncoded("metricNames".into(), "mem used".into()),
                Matcher::UrlEncoded("timezone".into(), "Asia/Seoul".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"ok","message":"","data":{}}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let query = [
            ("metricNames", "cpu".to_string()),
            ("metricNames", "mem used".to_string()),
            ("timezone", "Asia/Seoul".to_string()),
        ];
        let data: Grouped<Row> = client.get_data("api/v1/metrics/1/nodes", &query).await.unwrap();

        mock.assert_async().await;
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_error_envelope_message_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/snapshot/1/nodes")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"bad","message":"unknown metric name: nope"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client
            .get_data::<Grouped<Row>>("api/v1/snapshot/1/nodes", &[])
            .await
            .unwrap_err()
            .to_string();

        assert!(err.contains("404"));
        assert!(err.contains("unknown metric name: nope"));
        assert!(!err.contains("\"status\""));
    }

    #[tokio::test]
    async fn test_missing_data_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/health")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"status":"ok","message":""}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let envelope: Envelope<()> = client.get("api/v1/health", &[]).await.unwrap();
        assert_eq!(envelope.status, "ok");

        let result = client.get_data::<Vec<Cluster>>("api/v1/health", &[]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_base_url_is_rejected() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
