//! Core data models for the query service
//!
//! Catalog items mirror the listing endpoints one to one. Sample rows carry
//! an [`EntityRef`] whose serialized field names depend on the entity kind,
//! so a node sample renders as `{"node": .., "node_id": ..}` and a process
//! sample as `{"process": .., "process_id": ..}`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

/// Cluster listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterItem {
    pub id: i64,
    pub name: String,
    /// True when a Kubernetes cluster record links to this cluster
    pub kubernetes: bool,
}

/// Agent listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentItem {
    pub id: i64,
    pub version: String,
    pub ip: String,
    pub online: bool,
}

/// Node listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeItem {
    pub id: i64,
    pub host: String,
    pub ip: String,
    pub os: String,
    pub platform: String,
    pub platform_family: String,
    pub platform_version: String,
    pub agent_id: i64,
}

/// Metric catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricNameItem {
    pub id: i64,
    pub name: String,
    pub help: String,
    #[serde(rename = "type")]
    pub metric_type: String,
}

/// A listing entry tagged with the name of its owning cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Owned<T> {
    pub cluster_name: String,
    pub item: T,
}

/// The entity a sample or bucket belongs to
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRef {
    Node { id: i64, host: String },
    Process { id: i64, name: String },
    Container { id: i64, name: String },
    Pod { id: i64, name: String, namespace: String },
    /// Cluster-wide rollup; carries no entity fields
    Cluster,
}

impl EntityRef {
    /// Human-readable name used to group results
    pub fn name(&self) -> &str {
        match self {
            EntityRef::Node { host, .. } => host,
            EntityRef::Process { name, .. }
            | EntityRef::Container { name, .. }
            | EntityRef::Pod { name, .. } => name,
            EntityRef::Cluster => "",
        }
    }

    fn field_count(&self) -> usize {
        match self {
            EntityRef::Cluster => 0,
            _ => 2,
        }
    }

    fn serialize_fields<M: SerializeMap>(&self, map: &mut M) -> Result<(), M::Error> {
        match self {
            EntityRef::Node { id, host } => {
                map.serialize_entry("node", host)?;
                map.serialize_entry("node_id", id)
            }
            EntityRef::Process { id, name } => {
                map.serialize_entry("process", name)?;
                map.serialize_entry("process_id", id)
            }
            EntityRef::Container { id, name } => {
                map.serialize_entry("container", name)?;
                map.serialize_entry("container_id", id)
            }
            EntityRef::Pod { name, namespace, .. } => {
                map.serialize_entry("pod", name)?;
                map.serialize_entry("namespace", namespace)
            }
            EntityRef::Cluster => Ok(()),
        }
    }
}

/// Latest value of one series
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub entity: EntityRef,
    pub ts: DateTime<Utc>,
    pub value: f64,
    pub metric_name: String,
    /// Absent for rollups, which sum across labels
    pub metric_label: Option<String>,
}

impl Serialize for SnapshotRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.entity.field_count() + 3 + usize::from(self.metric_label.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        self.entity.serialize_fields(&mut map)?;
        map.serialize_entry("ts", &self.ts)?;
        map.serialize_entry("value", &self.value)?;
        map.serialize_entry("metric_name", &self.metric_name)?;
        if let Some(label) = &self.metric_label {
            map.serialize_entry("metric_label", label)?;
        }
        map.end()
    }
}

/// One aggregated bucket of a series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesRow {
    pub entity: EntityRef,
    /// Bucket start on the wall clock of the requested timezone
    pub bucket: NaiveDateTime,
    pub value: f64,
    pub metric_name: String,
    pub metric_label: Option<String>,
}

impl Serialize for SeriesRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = self.entity.field_count() + 3 + usize::from(self.metric_label.is_some());
        let mut map = serializer.serialize_map(Some(len))?;
        self.entity.serialize_fields(&mut map)?;
        map.serialize_entry("value", &self.value)?;
        map.serialize_entry("bucket", &self.bucket)?;
        map.serialize_entry("metric_name", &self.metric_name)?;
        if let Some(label) = &self.metric_label {
            map.serialize_entry("metric_label", label)?;
        }
        map.end()
    }
}

/// Summed latest value of one metric for a cluster or node
#[derive(Debug, Clone, PartialEq)]
pub struct RollupRow {
    pub group_id: i64,
    pub group_name: String,
    pub metric_name: String,
    pub value: f64,
}

/// Incident raised by the alerting side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub name: String,
    pub cluster_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<i64>,
    pub target: String,
    pub value: f64,
    pub message: String,
    pub detected_ts: DateTime<Utc>,
}

/// Round to two decimals, half away from zero
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_snapshot_row_field_names_follow_entity() {
        let row = SnapshotRow {
            entity: EntityRef::Process {
                id: 4,
                name: "nginx".into(),
            },
            ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            value: 12.5,
            metric_name: "cpu".into(),
            metric_label: Some("core0".into()),
        };

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["process"], "nginx");
        assert_eq!(json["process_id"], 4);
        assert_eq!(json["metric_label"], "core0");
        assert!(json.get("node").is_none());
    }

    #[test]
    fn test_pod_rollup_omits_label() {
        let row = SeriesRow {
            entity: EntityRef::Pod {
                id: 1,
                name: "api-7d9".into(),
                namespace: "default".into(),
            },
            bucket: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 5, 0)
                .unwrap()
                .naive_utc(),
            value: 3.0,
            metric_name: "memory".into(),
            metric_label: None,
        };

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["pod"], "api-7d9");
        assert_eq!(json["namespace"], "default");
        assert_eq!(json["bucket"], "2024-01-01T00:05:00");
        assert!(json.get("metric_label").is_none());
    }

    #[test]
    fn test_cluster_row_has_no_entity_fields() {
        let row = SeriesRow {
            entity: EntityRef::Cluster,
            bucket: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap().naive_utc(),
            value: 1.0,
            metric_name: "cpu".into(),
            metric_label: None,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.005_f64 * 1000.0), 1005.0);
        assert_eq!(round2(2.345_67), 2.35);
        assert_eq!(round2(-0.125), -0.13);
    }
}
