//! Metrics store access
//!
//! The [`MetricStore`] trait is the seam between query planning and
//! execution. Two backends implement it:
//! - [`PgStore`]: renders plans as parameterized PostgreSQL queries
//! - [`MemoryStore`]: evaluates plans directly over in-memory tables
//!
//! Every row-producing call returns a [`RowSet`]: a store-level failure
//! aborts the call, while each row carries its own decode result so one bad
//! row never fails the request.

mod memory;
mod postgres;

pub use memory::{MemoryStore, MetricSample};
pub use postgres::PgStore;

use crate::error::{Result, RowError};
use crate::models::{
    AgentItem, ClusterItem, MetricNameItem, NodeItem, Owned, RollupRow, SeriesRow, SnapshotRow,
};
use crate::plan::{SeriesPlan, SnapshotPlan, SummaryPlan};
use crate::scope::EntityId;
use serde::Deserialize;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Rows as returned by a store, each decoded independently
pub type RowSet<T> = Vec<std::result::Result<T, RowError>>;

/// Read access to the metrics store
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Check that the store is reachable
    async fn ping(&self) -> Result<()>;

    async fn clusters(&self) -> Result<RowSet<ClusterItem>>;

    /// Agents, optionally restricted to one cluster
    async fn agents(&self, cluster_id: Option<EntityId>) -> Result<RowSet<Owned<AgentItem>>>;

    /// Nodes, optionally restricted to one cluster
    async fn nodes(&self, cluster_id: Option<EntityId>) -> Result<RowSet<Owned<NodeItem>>>;

    async fn metric_names(&self) -> Result<RowSet<MetricNameItem>>;

    /// Ids of the catalog entries whose name exactly matches one of `names`
    async fn metric_ids(&self, names: &[String]) -> Result<Vec<i64>>;

    async fn snapshot(&self, plan: &SnapshotPlan) -> Result<RowSet<SnapshotRow>>;

    async fn series(&self, plan: &SeriesPlan) -> Result<RowSet<SeriesRow>>;

    async fn summary(&self, plan: &SummaryPlan) -> Result<RowSet<RollupRow>>;
}

/// Available store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Postgres,
    Memory,
}

/// Create the store for the configured backend
pub fn create_store(
    kind: StoreKind,
    database_url: &str,
    max_connections: u32,
) -> anyhow::Result<Arc<dyn MetricStore>> {
    match kind {
        StoreKind::Postgres => {
            tracing::info!(max_connections, "Using PostgreSQL metrics store");
            Ok(Arc::new(PgStore::connect_lazy(database_url, max_connections)?))
        }
        StoreKind::Memory => {
            tracing::warn!("Using in-memory metrics store, data is not persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
