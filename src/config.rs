use regex::Regex;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

/// Default allow-list for command identifiers, applied after lowercasing.
pub const DEFAULT_IDENTIFIER_PATTERN: &str = "[a-z0-9_-]{1,128}";
pub const DEFAULT_RESPONSE_URL_PREFIX: &str = "https://hooks.slack.com/";
pub const DEFAULT_BIGQUERY_API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Each rendered record costs up to three blocks; Slack caps a message at 50.
pub const MAX_RESULTS_CEILING: usize = 16;

static PROJECT_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9-]{4,28}[a-z0-9]$").expect("Invalid project id regex")
});

static DATASET_OR_TABLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,1024}$").expect("Invalid table regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// A fully-qualified BigQuery table. Its parts are interpolated into SQL, so
/// they are only constructed through validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    project: String,
    dataset: String,
    table: String,
}

impl TableRef {
    pub fn new(project: &str, dataset: &str, table: &str) -> Result<Self, ConfigError> {
        if !PROJECT_ID_REGEX.is_match(project) {
            return Err(ConfigError::Invalid {
                name: "BIGQUERY_PROJECT_ID",
                reason: format!("'{}' is not a valid project id", project),
            });
        }
        for (name, value) in [("BIGQUERY_DATASET_ID", dataset), ("table id", table)] {
            if !DATASET_OR_TABLE_REGEX.is_match(value) {
                return Err(ConfigError::Invalid {
                    name,
                    reason: format!("'{}' contains characters outside [A-Za-z0-9_-]", value),
                });
            }
        }
        Ok(Self {
            project: project.to_string(),
            dataset: dataset.to_string(),
            table: table.to_string(),
        })
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}.{}.{}`", self.project, self.dataset, self.table)
    }
}

#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub location: Option<String>,
    pub access_token: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub signing_secret: String,
    pub signature_tolerance: Duration,
    pub ack_deadline: Duration,
    pub lookup_timeout: Duration,
    pub max_results: usize,
    pub identifier_pattern: Regex,
    pub response_url_prefix: String,
    pub instances_table: TableRef,
    pub status_table: TableRef,
    pub bigquery: BigQueryConfig,
    pub port: u16,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| {
            var(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let signing_secret = required("SLACK_SIGNING_SECRET")?;
        let project_id = required("BIGQUERY_PROJECT_ID")?;
        let dataset_id = required("BIGQUERY_DATASET_ID")?;
        let instances_table =
            TableRef::new(&project_id, &dataset_id, &required("INSTANCES_TABLE_ID")?)?;
        let status_table =
            TableRef::new(&project_id, &dataset_id, &required("STATUS_CHECK_TABLE_ID")?)?;

        let pattern = var("IDENTIFIER_PATTERN")
            .unwrap_or_else(|| DEFAULT_IDENTIFIER_PATTERN.to_string());
        let identifier_pattern = anchored_pattern(&pattern)?;

        let max_results: usize = parse_or(&var, "MAX_RESULTS", 5)?;

        Ok(Self {
            signing_secret,
            signature_tolerance: Duration::from_secs(parse_or(
                &var,
                "SIGNATURE_TOLERANCE_SECS",
                300,
            )?),
            ack_deadline: Duration::from_millis(parse_or(&var, "ACK_DEADLINE_MS", 2500)?),
            lookup_timeout: Duration::from_secs(parse_or(&var, "LOOKUP_TIMEOUT_SECS", 30)?),
            max_results: max_results.clamp(1, MAX_RESULTS_CEILING),
            identifier_pattern,
            response_url_prefix: var("RESPONSE_URL_PREFIX")
                .unwrap_or_else(|| DEFAULT_RESPONSE_URL_PREFIX.to_string()),
            instances_table,
            status_table,
            bigquery: BigQueryConfig {
                project_id,
                location: var("BIGQUERY_LOCATION").filter(|v| !v.is_empty()),
                access_token: var("BIGQUERY_ACCESS_TOKEN").filter(|v| !v.is_empty()),
                api_base: var("BIGQUERY_API_BASE")
                    .unwrap_or_else(|| DEFAULT_BIGQUERY_API_BASE.to_string()),
            },
            port: parse_or(&var, "PORT", 3000)?,
        })
    }
}

/// Compiles `pattern` so that it must match the whole identifier.
pub fn anchored_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| ConfigError::Invalid {
        name: "IDENTIFIER_PATTERN",
        reason: e.to_string(),
    })
}

fn parse_or<F, T>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match var(name) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}
