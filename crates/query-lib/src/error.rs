//! Error types for the query engine
//!
//! Errors fall into two families: client input errors, which are reported
//! back to the caller verbatim, and store execution errors, whose cause is
//! only logged server-side.

use thiserror::Error;

/// Result alias used throughout the query engine
pub type Result<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    /// A path identifier failed validation
    #[error("invalid {param}: {reason}")]
    InvalidScope { param: &'static str, reason: String },

    /// A required path or query parameter was not supplied
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    /// One or more requested metric names are not in the catalog
    #[error("unknown metric names: requested {requested}, resolved {resolved}")]
    UnknownMetricName { requested: usize, resolved: usize },

    /// The same metric name was requested more than once
    #[error("duplicate metric name: {0}")]
    DuplicateMetricName(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// The JSON `query` parameter could not be decoded
    #[error("invalid query parameters: {0}")]
    InvalidQuery(String),

    /// The metrics store rejected or failed to execute a query
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Store failure reported by a non-SQL backend
    #[error("store error: {0}")]
    Backend(String),

    #[error("query timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl QueryError {
    /// True for errors caused by the request rather than the service
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            QueryError::InvalidScope { .. }
                | QueryError::MissingParameter(_)
                | QueryError::UnknownMetricName { .. }
                | QueryError::DuplicateMetricName(_)
                | QueryError::InvalidDateRange(_)
                | QueryError::InvalidTimezone(_)
                | QueryError::InvalidQuery(_)
        )
    }

    /// Short machine-readable name, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::InvalidScope { .. } => "invalid_scope",
            QueryError::MissingParameter(_) => "missing_parameter",
            QueryError::UnknownMetricName { .. } => "unknown_metric_name",
            QueryError::DuplicateMetricName(_) => "duplicate_metric_name",
            QueryError::InvalidDateRange(_) => "invalid_date_range",
            QueryError::InvalidTimezone(_) => "invalid_timezone",
            QueryError::InvalidQuery(_) => "invalid_query",
            QueryError::Store(_) | QueryError::Backend(_) => "store",
            QueryError::Timeout(_) => "timeout",
        }
    }
}

/// Failure to decode a single result row
///
/// Row errors never abort a request; the shaper skips the row and counts it.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("column decode failed: {0}")]
    Decode(#[from] sqlx::Error),

    /// A fact row references a catalog entry that does not exist
    #[error("dangling {table} reference: {id}")]
    MissingReference { table: &'static str, id: i64 },
}
