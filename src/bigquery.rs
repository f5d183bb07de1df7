use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::BigQueryConfig;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Server-side wait per `jobs.query` / `jobs.getQueryResults` call.
const SERVER_WAIT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("BigQuery API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("query job failed: {0}")]
    Job(String),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("lookup did not finish within {0:?}")]
    Timeout(Duration),
}

/// One exported asset row. Columns differ between tables, so values are kept
/// by column name as BigQuery returns them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetRecord {
    columns: BTreeMap<String, Option<String>>,
}

impl AssetRecord {
    /// Returns a non-empty column value.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .get(column)
            .and_then(|v| v.as_deref())
            .filter(|v| !v.trim().is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, Option<V>)> for AssetRecord {
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        Self {
            columns: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameter {
    pub name: &'static str,
    pub value: String,
}

/// SQL text plus named STRING parameters bound at execution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterizedQuery {
    sql: String,
    parameters: Vec<QueryParameter>,
}

impl ParameterizedQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    pub fn bind(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.parameters.push(QueryParameter {
            name,
            value: value.into(),
        });
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[QueryParameter] {
        &self.parameters
    }
}

/// Read-only access to the asset export tables.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn query(&self, query: &ParameterizedQuery) -> Result<Vec<AssetRecord>, StoreError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    parameter_mode: &'static str,
    query_parameters: Vec<QueryParameterJson<'a>>,
    timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryParameterJson<'a> {
    name: &'a str,
    parameter_type: ParameterType,
    parameter_value: ParameterValue<'a>,
}

#[derive(Debug, Serialize)]
struct ParameterType {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ParameterValue<'a> {
    value: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    job_reference: Option<JobReference>,
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    #[serde(default)]
    v: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone)]
struct TokenCache {
    access_token: String,
    expires_at: Instant,
}

enum TokenSource {
    Static(String),
    Metadata(Mutex<Option<TokenCache>>),
}

pub struct BigQueryClient {
    project_id: String,
    location: Option<String>,
    api_base: String,
    tokens: TokenSource,
    client: reqwest::Client,
}

impl BigQueryClient {
    pub fn new(config: &BigQueryConfig) -> Self {
        let tokens = match &config.access_token {
            Some(token) => TokenSource::Static(token.clone()),
            None => TokenSource::Metadata(Mutex::new(None)),
        };
        Self {
            project_id: config.project_id.clone(),
            location: config.location.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            tokens,
            client: reqwest::Client::new(),
        }
    }

    async fn get_access_token(&self) -> Result<String, StoreError> {
        let cache = match &self.tokens {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::Metadata(cache) => cache,
        };

        let mut cache = cache.lock().await;
        if let Some(ref token_cache) = *cache {
            if token_cache.expires_at > Instant::now() {
                return Ok(token_cache.access_token.clone());
            }
        }

        let response = self
            .client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| StoreError::Auth(format!("Metadata server unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(format!(
                "Token request failed: {} - {}",
                status, text
            )));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Auth(format!("Parse failed: {}", e)))?;

        // Refresh a minute early.
        let expires_at =
            Instant::now() + Duration::from_secs(token_response.expires_in.saturating_sub(60));
        *cache = Some(TokenCache {
            access_token: token_response.access_token.clone(),
            expires_at,
        });

        Ok(token_response.access_token)
    }

    async fn start_query(
        &self,
        query: &ParameterizedQuery,
        access_token: &str,
    ) -> Result<QueryResponse, StoreError> {
        let url = format!("{}/projects/{}/queries", self.api_base, self.project_id);
        let body = build_query_request(query, self.location.as_deref());

        let response = self
            .client
            .post(&url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Network(format!("Request failed: {}", e)))?;

        read_query_response(response).await
    }

    async fn poll_results(
        &self,
        job: &JobReference,
        access_token: &str,
    ) -> Result<QueryResponse, StoreError> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.api_base, self.project_id, job.job_id
        );
        let mut params = vec![("timeoutMs", SERVER_WAIT_MS.to_string())];
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            params.push(("location", location.clone()));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(access_token)
            .query(&params)
            .send()
            .await
            .map_err(|e| StoreError::Network(format!("Request failed: {}", e)))?;

        read_query_response(response).await
    }
}

#[async_trait]
impl AssetStore for BigQueryClient {
    async fn query(&self, query: &ParameterizedQuery) -> Result<Vec<AssetRecord>, StoreError> {
        let access_token = self.get_access_token().await?;
        let mut response = self.start_query(query, &access_token).await?;

        while !response.job_complete {
            let job = response.job_reference.as_ref().ok_or_else(|| {
                StoreError::Decode("incomplete job without a jobReference".to_string())
            })?;
            debug!("Query job {} still running, polling", job.job_id);
            response = self.poll_results(job, &access_token).await?;
        }

        let records = records_from(response)?;
        info!("BigQuery returned {} row(s)", records.len());
        Ok(records)
    }
}

fn build_query_request<'a>(
    query: &'a ParameterizedQuery,
    location: Option<&'a str>,
) -> QueryRequest<'a> {
    QueryRequest {
        query: query.sql(),
        use_legacy_sql: false,
        parameter_mode: "NAMED",
        query_parameters: query
            .parameters()
            .iter()
            .map(|p| QueryParameterJson {
                name: p.name,
                parameter_type: ParameterType { kind: "STRING" },
                parameter_value: ParameterValue { value: &p.value },
            })
            .collect(),
        timeout_ms: SERVER_WAIT_MS,
        location,
    }
}

async fn read_query_response(response: reqwest::Response) -> Result<QueryResponse, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorResponse>(&text)
            .ok()
            .and_then(|e| e.error)
            .and_then(|e| e.message)
            .unwrap_or(text);
        return Err(StoreError::Api {
            status: status.as_u16(),
            message,
        });
    }

    response
        .json()
        .await
        .map_err(|e| StoreError::Decode(format!("Parse failed: {}", e)))
}

fn records_from(response: QueryResponse) -> Result<Vec<AssetRecord>, StoreError> {
    if let Some(err) = response.errors.first() {
        return Err(StoreError::Job(format!(
            "{}: {}",
            err.reason.as_deref().unwrap_or("error"),
            err.message.as_deref().unwrap_or("no message")
        )));
    }

    if response.rows.is_empty() {
        return Ok(Vec::new());
    }

    let fields = response
        .schema
        .map(|s| s.fields)
        .ok_or_else(|| StoreError::Decode("rows returned without a schema".to_string()))?;

    response
        .rows
        .into_iter()
        .map(|row| {
            if row.f.len() != fields.len() {
                return Err(StoreError::Decode(format!(
                    "row has {} cells but schema has {} fields",
                    row.f.len(),
                    fields.len()
                )));
            }
            Ok(fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), cell_text(cell.v)))
                .collect::<AssetRecord>())
        })
        .collect()
}

fn cell_text(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
