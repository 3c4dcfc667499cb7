//! Query-string parameters shared by the snapshot and series endpoints
//!
//! Parameters arrive either as individual (possibly repeated) keys:
//! `?metricNames=cpu&metricNames=mem&dateRange=..&dateRange=..`, or as a
//! single JSON document in `?query=`. Values are used as data only: names
//! are matched through bound parameters and bounds are parsed into
//! timestamps, so no character filtering is applied.

use crate::error::{QueryError, Result};
use crate::granularity::{self, parse_timezone, SeriesWindow};
use chrono_tz::Tz;
use serde::{Deserialize, Deserializer};

pub const QUERY: &str = "query";
pub const TIMEZONE: &str = "timezone";
pub const METRIC_NAMES: &str = "metricNames";
pub const DATE_RANGE: &str = "dateRange";
pub const GRANULARITY: &str = "granularity";

/// Raw parameters as sent by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParams {
    #[serde(deserialize_with = "null_as_default")]
    pub timezone: String,
    #[serde(deserialize_with = "null_as_default")]
    pub metric_names: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub date_range: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub granularity: String,
}

/// JSON `null` reads as an absent field
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl QueryParams {
    /// Collect parameters from decoded query-string pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = QueryParams::default();
        let mut json = None;

        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                QUERY if !value.is_empty() => json = Some(value.to_string()),
                TIMEZONE => params.timezone = value.to_string(),
                METRIC_NAMES => params.metric_names.push(value.to_string()),
                DATE_RANGE => params.date_range.push(value.to_string()),
                GRANULARITY => params.granularity = value.to_string(),
                _ => {}
            }
        }

        // A JSON document replaces the individual keys entirely
        match json {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| QueryError::InvalidQuery(e.to_string())),
            None => Ok(params),
        }
    }

    /// Validate the timezone and normalize empty values
    pub fn validate(self) -> Result<ParsedQuery> {
        let timezone = match self.timezone.trim() {
            "" => Tz::UTC,
            name => parse_timezone(name)?,
        };
        let granularity = match self.granularity.trim() {
            "" => None,
            g => Some(g.to_string()),
        };

        Ok(ParsedQuery {
            timezone,
            metric_names: self.metric_names,
            date_range: self.date_range,
            granularity,
        })
    }
}

/// Validated request parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub timezone: Tz,
    pub metric_names: Vec<String>,
    pub date_range: Vec<String>,
    pub granularity: Option<String>,
}

impl ParsedQuery {
    pub fn parse<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        QueryParams::from_pairs(pairs)?.validate()
    }

    /// Series endpoints need metric names and a date range
    pub fn require_series(&self) -> Result<()> {
        if self.metric_names.is_empty() {
            return Err(QueryError::MissingParameter(METRIC_NAMES));
        }
        if self.date_range.is_empty() {
            return Err(QueryError::MissingParameter(DATE_RANGE));
        }
        Ok(())
    }

    /// Plan the bucketing for this request
    pub fn window(&self) -> Result<SeriesWindow> {
        granularity::plan(&self.date_range, self.timezone, self.granularity.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_keys_are_collected() {
        let query = ParsedQuery::parse([
            ("metricNames", "cpu"),
            ("metricNames", "mem"),
            ("dateRange", "2024-01-01 00:00:00"),
            ("dateRange", "2024-01-01 01:00:00"),
            ("timezone", "Asia/Seoul"),
        ])
        .unwrap();

        assert_eq!(query.metric_names, vec!["cpu", "mem"]);
        assert_eq!(query.date_range.len(), 2);
        assert_eq!(query.timezone, Tz::Asia__Seoul);
        assert_eq!(query.granularity, None);
    }

    #[test]
    fn test_json_query_parameter() {
        let raw = r#"{"timezone":"UTC","metricNames":["cpu"],"dateRange":["2024-01-01 00:00:00","2024-01-02 00:00:00"],"granularity":"hour"}"#;
        let query = ParsedQuery::parse([("query", raw), ("metricNames", "ignored")]).unwrap();

        assert_eq!(query.metric_names, vec!["cpu"]);
        assert_eq!(query.granularity.as_deref(), Some("hour"));
    }

    #[test]
    fn test_json_nulls_read_as_empty() {
        let raw = r#"{"timezone":null,"metricNames":null,"dateRange":null,"granularity":null}"#;
        let query = ParsedQuery::parse([("query", raw)]).unwrap();

        assert!(query.metric_names.is_empty());
        assert!(query.date_range.is_empty());
        assert_eq!(query.timezone, Tz::UTC);
        assert_eq!(query.granularity, None);
    }

    #[test]
    fn test_malformed_json_is_client_error() {
        let err = ParsedQuery::parse([("query", "{not json")]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_timezone_defaults_to_utc_and_is_validated() {
        let empty: [(&str, &str); 0] = [];
        assert_eq!(ParsedQuery::parse(empty).unwrap().timezone, Tz::UTC);

        let err = ParsedQuery::parse([("timezone", "Mars/Olympus")]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidTimezone(_)));
    }

    #[test]
    fn test_quotes_are_kept_as_data() {
        let query = ParsedQuery::parse([("metricNames", "cpu' OR '1'='1")]).unwrap();
        assert_eq!(query.metric_names, vec!["cpu' OR '1'='1"]);
    }

    #[test]
    fn test_series_requirements() {
        let query = ParsedQuery::parse([("metricNames", "cpu")]).unwrap();
        assert!(matches!(
            query.require_series(),
            Err(QueryError::MissingParameter("dateRange"))
        ));

        let query = ParsedQuery::parse([("dateRange", "2024-01-01 00:00:00")]).unwrap();
        assert!(matches!(
            query.require_series(),
            Err(QueryError::MissingParameter("metricNames"))
        ));
    }
}
