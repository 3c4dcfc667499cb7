//! Result shaping
//!
//! Turns flat store rows into response payloads. Rows that failed to decode
//! are split off first so a single bad row never fails a request; grouping
//! uses ordered maps so identical requests serialize to identical bytes.

use crate::error::RowError;
use crate::models::{Owned, RollupRow};
use crate::store::RowSet;
use std::collections::BTreeMap;

/// Decoded rows plus the errors of the rows that were dropped
#[derive(Debug)]
pub struct Shaped<T> {
    pub rows: Vec<T>,
    pub skipped: Vec<RowError>,
}

impl<T> Shaped<T> {
    pub fn split(rows: RowSet<T>) -> Self {
        let mut shaped = Shaped {
            rows: Vec::with_capacity(rows.len()),
            skipped: Vec::new(),
        };
        for row in rows {
            match row {
                Ok(row) => shaped.rows.push(row),
                Err(e) => shaped.skipped.push(e),
            }
        }
        shaped
    }
}

/// Group rows by a key, keeping arrival order inside each group
pub fn group_by<T>(rows: Vec<T>, key: impl Fn(&T) -> String) -> BTreeMap<String, Vec<T>> {
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for row in rows {
        groups.entry(key(&row)).or_default().push(row);
    }
    groups
}

/// Group listing entries by their owning cluster's name
pub fn group_by_cluster<T>(rows: Vec<Owned<T>>) -> BTreeMap<String, Vec<T>> {
    let mut groups: BTreeMap<String, Vec<T>> = BTreeMap::new();
    for owned in rows {
        groups.entry(owned.cluster_name).or_default().push(owned.item);
    }
    groups
}

/// Summary key for a rollup row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollupKey {
    /// Keyed by numeric group id (clusters)
    Id,
    /// Keyed by group name (node hosts)
    Name,
}

/// Fold rollup rows into `group -> {metric -> value}`
pub fn rollup_map(rows: Vec<RollupRow>, key: RollupKey) -> BTreeMap<String, BTreeMap<String, f64>> {
    let mut groups: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    for row in rows {
        let group = match key {
            RollupKey::Id => row.group_id.to_string(),
            RollupKey::Name => row.group_name,
        };
        groups.entry(group).or_default().insert(row.metric_name, row.value);
    }
    groups
}
