//! HTTP API under `/api/v1`, plus Prometheus metrics
//!
//! Every response uses the same envelope:
//! `{status: "ok"|"bad", message, data?, db_query_time?, count?}`.
//! Client input errors answer 404 with the reason, store failures answer
//! 500 with a generic message (the cause is logged by the query service).

use axum::{
    extract::{Path, RawQuery, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, MethodRouter},
    Json, Router,
};
use query_lib::{
    EndpointFamily, IncidentBoard, IngestStats, QueryError, QueryMetrics, QueryService, SeriesData,
    Timed,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Message returned for store failures; details stay in the logs
pub const STORE_FAILURE_MESSAGE: &str = "failed to get data";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub service: QueryService,
    pub ingest: Arc<IngestStats>,
    pub incidents: Arc<IncidentBoard>,
    pub metrics: QueryMetrics,
}

impl AppState {
    pub fn new(service: QueryService, ingest: Arc<IngestStats>, incidents: Arc<IncidentBoard>) -> Self {
        Self {
            metrics: service.metrics().clone(),
            service,
            ingest,
            incidents,
        }
    }
}

/// Response envelope
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_query_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: "ok",
            message: String::new(),
            data: Some(data),
            db_query_time: None,
            count: None,
        }
    }

    pub fn timed(timed: Timed<T>) -> Self {
        let db_query_time = Some(timed.db_query_time());
        Self {
            db_query_time,
            ..Self::ok(timed.data)
        }
    }

    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

fn bad(status: StatusCode, message: impl Into<String>) -> Response {
    let body: Envelope<()> = Envelope {
        status: "bad",
        message: message.into(),
        data: None,
        db_query_time: None,
        count: None,
    };
    (status, Json(body)).into_response()
}

fn error_response(err: QueryError) -> Response {
    if err.is_client_error() {
        bad(StatusCode::NOT_FOUND, err.to_string())
    } else {
        bad(StatusCode::INTERNAL_SERVER_ERROR, STORE_FAILURE_MESSAGE)
    }
}

fn respond<T: Serialize>(result: query_lib::Result<Timed<T>>) -> Response {
    match result {
        Ok(timed) => Envelope::timed(timed).into_response(),
        Err(e) => error_response(e),
    }
}

/// Decode a raw query string, keeping repeated keys
fn query_pairs(raw: Option<String>) -> Vec<(String, String)> {
    raw.map(|raw| url::form_urlencoded::parse(raw.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn path_params(path: Option<Path<HashMap<String, String>>>) -> HashMap<String, String> {
    path.map(|Path(params)| params).unwrap_or_default()
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.service.health().await {
        Ok(()) => {
            let body: Envelope<()> = Envelope {
                data: None,
                ..Envelope::ok(())
            };
            body.into_response()
        }
        Err(_) => bad(StatusCode::INTERNAL_SERVER_ERROR, "DB connection failed"),
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    Envelope::ok(state.ingest.report()).into_response()
}

async fn clusters(State(state): State<Arc<AppState>>) -> Response {
    respond(state.service.clusters().await)
}

async fn agents(State(state): State<Arc<AppState>>, path: Option<Path<HashMap<String, String>>>) -> Response {
    let path = path_params(path);
    respond(state.service.agents(path.get("clusterId").map(String::as_str)).await)
}

async fn nodes(State(state): State<Arc<AppState>>, path: Option<Path<HashMap<String, String>>>) -> Response {
    let path = path_params(path);
    respond(state.service.nodes(path.get("clusterId").map(String::as_str)).await)
}

async fn metric_names(State(state): State<Arc<AppState>>) -> Response {
    respond(state.service.metric_names().await)
}

async fn summary_clusters(
    State(state): State<Arc<AppState>>,
    path: Option<Path<HashMap<String, String>>>,
) -> Response {
    let path = path_params(path);
    respond(
        state
            .service
            .summary_clusters(path.get("clusterId").map(String::as_str))
            .await,
    )
}

async fn summary_nodes(
    State(state): State<Arc<AppState>>,
    path: Option<Path<HashMap<String, String>>>,
) -> Response {
    let path = path_params(path);
    respond(
        state
            .service
            .summary_nodes(
                path.get("clusterId").map(String::as_str),
                path.get("nodeId").map(String::as_str),
            )
            .await,
    )
}

async fn incidents(State(state): State<Arc<AppState>>) -> Response {
    Envelope::ok(state.incidents.list().await).into_response()
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

async fn not_found() -> Response {
    bad(StatusCode::NOT_FOUND, "not found")
}

fn snapshot_route(family: EndpointFamily) -> MethodRouter<Arc<AppState>> {
    get(
        move |State(state): State<Arc<AppState>>,
              path: Option<Path<HashMap<String, String>>>,
              RawQuery(query): RawQuery| async move {
            let path = path_params(path);
            respond(state.service.snapshot(family, &path, &query_pairs(query)).await)
        },
    )
}

fn series_route(family: EndpointFamily) -> MethodRouter<Arc<AppState>> {
    get(
        move |State(state): State<Arc<AppState>>,
              path: Option<Path<HashMap<String, String>>>,
              RawQuery(query): RawQuery| async move {
            let path = path_params(path);
            match state.service.series(family, &path, &query_pairs(query)).await {
                Ok(Timed {
                    data: SeriesData::Flat(rows),
                    elapsed,
                }) => {
                    let count = rows.len();
                    Envelope {
                        count: Some(count),
                        ..Envelope::timed(Timed { data: rows, elapsed })
                    }
                    .into_response()
                }
                Ok(Timed {
                    data: SeriesData::Grouped(groups),
                    elapsed,
                }) => Envelope::timed(Timed { data: groups, elapsed }).into_response(),
                Err(e) => error_response(e),
            }
        },
    )
}

/// Routes shared by the snapshot and series trees
fn entity_routes(route: fn(EndpointFamily) -> MethodRouter<Arc<AppState>>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/:clusterId/nodes", route(EndpointFamily::Nodes))
        .route("/:clusterId/nodes/:nodeId", route(EndpointFamily::Nodes))
        .route("/:clusterId/nodes/:nodeId/processes", route(EndpointFamily::Processes))
        .route(
            "/:clusterId/nodes/:nodeId/processes/:processId",
            route(EndpointFamily::Processes),
        )
        .route("/:clusterId/nodes/:nodeId/containers", route(EndpointFamily::Containers))
        .route(
            "/:clusterId/nodes/:nodeId/containers/:containerId",
            route(EndpointFamily::Containers),
        )
        .route("/:clusterId/k8s/pods", route(EndpointFamily::Pods))
        .route("/:clusterId/k8s/namespaces/:namespaceId/pods", route(EndpointFamily::Pods))
        .route(
            "/:clusterId/k8s/namespaces/:namespaceId/pods/:podId",
            route(EndpointFamily::Pods),
        )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let v1 = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/clusters", get(clusters))
        .route("/clusters/:clusterId/agents", get(agents))
        .route("/clusters/:clusterId/nodes", get(nodes))
        .route("/agents", get(agents))
        .route("/nodes", get(nodes))
        .route("/metric_names", get(metric_names))
        .nest("/snapshot", entity_routes(snapshot_route))
        .nest(
            "/metrics",
            entity_routes(series_route).route("/:clusterId/summary", series_route(EndpointFamily::ClusterSummary)),
        )
        .route("/summary/clusters", get(summary_clusters))
        .route("/summary/clusters/:clusterId", get(summary_clusters))
        .route("/summary/clusters/:clusterId/nodes", get(summary_nodes))
        .route("/summary/clusters/:clusterId/nodes/:nodeId", get(summary_nodes))
        .route("/incidents/basic", get(incidents));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api/v1", v1)
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .layer(cors)
        .with_state(state)
}

/// Start the API server, stopping once `shutdown` resolves
pub async fn serve(
    addr: String,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_pairs_keep_repeated_keys() {
        let pairs = query_pairs(Some("metricNames=cpu&metricNames=mem%20used&timezone=Asia%2FSeoul".into()));
        assert_eq!(
            pairs,
            vec![
                ("metricNames".to_string(), "cpu".to_string()),
                ("metricNames".to_string(), "mem used".to_string()),
                ("timezone".to_string(), "Asia/Seoul".to_string()),
            ]
        );
        assert!(query_pairs(None).is_empty());
    }

    #[test]
    fn test_envelope_omits_absent_fields() {
        let json = serde_json::to_value(Envelope::ok(vec![1, 2])).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["message"], "");
        assert!(json.get("db_query_time").is_none());
        assert!(json.get("count").is_none());
    }
}
