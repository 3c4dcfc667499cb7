//! Scope resolution
//!
//! Turns raw path identifiers into a validated [`Scope`]. Identifiers are
//! parsed as positive integers and later bound as typed query parameters,
//! so anything that is not a plain number is rejected here, before the
//! store is ever contacted.

use crate::error::{QueryError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

pub const CLUSTER_ID: &str = "clusterId";
pub const NODE_ID: &str = "nodeId";
pub const PROCESS_ID: &str = "processId";
pub const CONTAINER_ID: &str = "containerId";
pub const NAMESPACE_ID: &str = "namespaceId";
pub const POD_ID: &str = "podId";

/// Identifier of a catalog entity (cluster, node, process, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct EntityId(i64);

impl EntityId {
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    /// Parse a raw path segment
    pub fn parse(param: &'static str, raw: &str) -> Result<Self> {
        let id: i64 = raw.trim().parse().map_err(|_| QueryError::InvalidScope {
            param,
            reason: format!("{raw:?} is not a number"),
        })?;

        Self::new(id).ok_or_else(|| QueryError::InvalidScope {
            param,
            reason: format!("{id} is not a positive id"),
        })
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which entity level a fact row describes
///
/// Stored rows flag their level with `process_id = 0` / `container_id = 0`
/// sentinels; this enum is translated to those filters only when a plan is
/// executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityLevel {
    Node,
    Process,
    Container,
}

impl EntityLevel {
    /// Classify a stored row by its sentinel columns
    pub fn of_row(process_id: i64, container_id: i64) -> Option<Self> {
        match (process_id, container_id) {
            (0, 0) => Some(EntityLevel::Node),
            (p, 0) if p > 0 => Some(EntityLevel::Process),
            (0, c) if c > 0 => Some(EntityLevel::Container),
            _ => None,
        }
    }
}

/// The granularity at which results are reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryLevel {
    Node,
    Process,
    Container,
    /// Sum of container rows joined through the Kubernetes tables
    Pod,
    /// Sum of node rows across the whole cluster
    Cluster,
}

impl QueryLevel {
    /// Level of the fact rows that feed this query level
    pub fn row_level(self) -> EntityLevel {
        match self {
            QueryLevel::Node | QueryLevel::Cluster => EntityLevel::Node,
            QueryLevel::Process => EntityLevel::Process,
            QueryLevel::Container | QueryLevel::Pod => EntityLevel::Container,
        }
    }

    /// Rollup levels sum across child entities and drop labels
    pub fn is_rollup(self) -> bool {
        matches!(self, QueryLevel::Pod | QueryLevel::Cluster)
    }
}

/// Endpoint families, each with its own set of accepted identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointFamily {
    Nodes,
    Processes,
    Containers,
    Pods,
    ClusterSummary,
}

impl EndpointFamily {
    pub fn level(self) -> QueryLevel {
        match self {
            EndpointFamily::Nodes => QueryLevel::Node,
            EndpointFamily::Processes => QueryLevel::Process,
            EndpointFamily::Containers => QueryLevel::Container,
            EndpointFamily::Pods => QueryLevel::Pod,
            EndpointFamily::ClusterSummary => QueryLevel::Cluster,
        }
    }

    fn required(self) -> &'static [&'static str] {
        match self {
            EndpointFamily::Processes | EndpointFamily::Containers => &[CLUSTER_ID, NODE_ID],
            _ => &[CLUSTER_ID],
        }
    }

    fn accepted(self) -> &'static [&'static str] {
        match self {
            EndpointFamily::Nodes => &[CLUSTER_ID, NODE_ID],
            EndpointFamily::Processes => &[CLUSTER_ID, NODE_ID, PROCESS_ID],
            EndpointFamily::Containers => &[CLUSTER_ID, NODE_ID, CONTAINER_ID],
            EndpointFamily::Pods => &[CLUSTER_ID, NAMESPACE_ID, POD_ID],
            EndpointFamily::ClusterSummary => &[CLUSTER_ID],
        }
    }
}

/// Validated filter set narrowing a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub cluster_id: EntityId,
    pub node_id: Option<EntityId>,
    pub process_id: Option<EntityId>,
    pub container_id: Option<EntityId>,
    pub namespace_id: Option<EntityId>,
    pub pod_id: Option<EntityId>,
}

impl Scope {
    pub fn cluster(cluster_id: EntityId) -> Self {
        Self {
            cluster_id,
            node_id: None,
            process_id: None,
            container_id: None,
            namespace_id: None,
            pod_id: None,
        }
    }

    pub fn with_node(mut self, node_id: EntityId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    /// Resolve raw path parameters for an endpoint family
    pub fn resolve(family: EndpointFamily, params: &HashMap<String, String>) -> Result<Self> {
        for key in params.keys() {
            if !family.accepted().contains(&key.as_str()) {
                return Err(QueryError::InvalidScope {
                    param: "path",
                    reason: format!("{key} is not valid for this endpoint"),
                });
            }
        }

        let lookup = |name: &'static str| -> Result<Option<EntityId>> {
            match params.get(name).map(|v| v.trim()) {
                None | Some("") => Ok(None),
                Some(raw) => EntityId::parse(name, raw).map(Some),
            }
        };

        for &name in family.required() {
            if lookup(name)?.is_none() {
                return Err(QueryError::MissingParameter(name));
            }
        }

        let cluster_id = lookup(CLUSTER_ID)?.ok_or(QueryError::MissingParameter(CLUSTER_ID))?;
        let scope = Scope {
            cluster_id,
            node_id: lookup(NODE_ID)?,
            process_id: lookup(PROCESS_ID)?,
            container_id: lookup(CONTAINER_ID)?,
            namespace_id: lookup(NAMESPACE_ID)?,
            pod_id: lookup(POD_ID)?,
        };
        scope.check_hierarchy()?;

        Ok(scope)
    }

    fn check_hierarchy(&self) -> Result<()> {
        if self.process_id.is_some() && self.container_id.is_some() {
            return Err(QueryError::InvalidScope {
                param: PROCESS_ID,
                reason: "a scope targets either a process or a container".into(),
            });
        }
        if (self.process_id.is_some() || self.container_id.is_some()) && self.node_id.is_none() {
            return Err(QueryError::MissingParameter(NODE_ID));
        }
        if self.pod_id.is_some() && self.namespace_id.is_none() {
            return Err(QueryError::MissingParameter(NAMESPACE_ID));
        }
        if self.node_id.is_some() && (self.namespace_id.is_some() || self.pod_id.is_some()) {
            return Err(QueryError::InvalidScope {
                param: NAMESPACE_ID,
                reason: "kubernetes scopes are not nested under nodes".into(),
            });
        }
        Ok(())
    }
}
