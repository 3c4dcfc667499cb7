//! Metric name resolution
//!
//! Maps requested metric names to catalog ids. Resolution is all or
//! nothing: if any name is unknown or repeated the whole request fails.

use crate::error::{QueryError, Result};
use crate::plan::MetricFilter;
use crate::store::MetricStore;
use std::collections::HashSet;

/// Resolve names against the catalog (exact, case-sensitive)
pub async fn resolve(store: &dyn MetricStore, names: &[String]) -> Result<MetricFilter> {
    if names.is_empty() {
        return Ok(MetricFilter::all());
    }

    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(QueryError::DuplicateMetricName(name.clone()));
        }
    }

    let ids = store.metric_ids(names).await?;
    if ids.len() != names.len() {
        return Err(QueryError::UnknownMetricName {
            requested: names.len(),
            resolved: ids.len(),
        });
    }

    Ok(MetricFilter::new(ids))
}
