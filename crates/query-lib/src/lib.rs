//! Query engine for the monitoring read path
//!
//! This crate provides the core functionality for:
//! - Scope resolution over the cluster / node / process / container / pod hierarchy
//! - Metric name resolution and bucket (granularity) planning
//! - Snapshot and series query plans, executed by PostgreSQL or in memory
//! - Result shaping, ingest statistics and incidents
//! - Observability

pub mod error;
pub mod granularity;
pub mod incidents;
pub mod metric_names;
pub mod models;
pub mod observability;
pub mod plan;
pub mod request;
pub mod scope;
pub mod service;
pub mod shaper;
pub mod status;
pub mod store;

pub use error::{QueryError, Result, RowError};
pub use incidents::IncidentBoard;
pub use models::*;
pub use observability::{QueryMetrics, StructuredLogger};
pub use scope::{EndpointFamily, EntityId, QueryLevel, Scope};
pub use service::{Grouped, QueryService, Rollup, SeriesData, Timed};
pub use status::{IngestStats, StatusReport};
pub use store::{create_store, MemoryStore, MetricSample, MetricStore, PgStore, StoreKind};
