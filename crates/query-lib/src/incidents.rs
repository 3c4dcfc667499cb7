//! Incident board
//!
//! Incidents are raised by the alerting side and grouped by event name.
//! This service reads them back as one flat list, newest first.

use crate::models::Incident;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct IncidentBoard {
    events: RwLock<BTreeMap<String, Vec<Incident>>>,
}

impl IncidentBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, event: &str, incident: Incident) {
        self.events
            .write()
            .await
            .entry(event.to_string())
            .or_default()
            .push(incident);
    }

    /// Drop every incident of one event, e.g. once it resolves
    pub async fn clear(&self, event: &str) {
        self.events.write().await.remove(event);
    }

    /// All incidents, most recently detected first
    pub async fn list(&self) -> Vec<Incident> {
        let events = self.events.read().await;
        let mut incidents: Vec<Incident> = events.values().flatten().cloned().collect();
        incidents.sort_by(|a, b| b.detected_ts.cmp(&a.detected_ts));
        incidents
    }
}
