use tracing::info;

use crate::bigquery::{AssetStore, ParameterizedQuery, StoreError};
use crate::command::{CommandError, CommandKind};
use crate::config::{Config, TableRef};
use crate::format::{instance_message, status_message};
use crate::types::SlackMessage;

const IDENTIFIER_PARAM: &str = "resource_name";

/// Instance lookup by name or numeric ID. Fetches one row more than will be
/// rendered so truncation can be reported.
pub fn instance_query(table: &TableRef, identifier: &str, max_results: usize) -> ParameterizedQuery {
    ParameterizedQuery::new(format!(
        "SELECT instance_id, instance_name, project_id, status, zone, machine_type, creation_timestamp \
         FROM {table} \
         WHERE LOWER(instance_name) = @{param} OR LOWER(CAST(instance_id AS STRING)) = @{param} \
         LIMIT {limit}",
        table = table,
        param = IDENTIFIER_PARAM,
        limit = max_results + 1,
    ))
    .bind(IDENTIFIER_PARAM, identifier)
}

pub fn status_query(table: &TableRef, identifier: &str) -> ParameterizedQuery {
    ParameterizedQuery::new(format!(
        "SELECT item_name, current_status, details, last_checked \
         FROM {table} \
         WHERE LOWER(item_name) = @{param} \
         LIMIT 1",
        table = table,
        param = IDENTIFIER_PARAM,
    ))
    .bind(IDENTIFIER_PARAM, identifier)
}

/// Runs the query for `kind` and renders the reply. The whole lookup is
/// bounded by `config.lookup_timeout`.
pub async fn run_lookup(
    store: &dyn AssetStore,
    config: &Config,
    kind: CommandKind,
    identifier: &str,
) -> Result<SlackMessage, CommandError> {
    let query = match kind {
        CommandKind::GetInfo => {
            instance_query(&config.instances_table, identifier, config.max_results)
        }
        CommandKind::CheckStatus => status_query(&config.status_table, identifier),
    };

    info!("Running {} lookup for '{}'", kind.name(), identifier);
    let records = tokio::time::timeout(config.lookup_timeout, store.query(&query))
        .await
        .map_err(|_| StoreError::Timeout(config.lookup_timeout))??;

    let not_found = || CommandError::NotFound {
        kind,
        identifier: identifier.to_string(),
    };

    match kind {
        CommandKind::GetInfo if records.is_empty() => Err(not_found()),
        CommandKind::GetInfo => {
            info!("Found {} record(s) for '{}'", records.len(), identifier);
            Ok(instance_message(identifier, &records, config.max_results))
        }
        CommandKind::CheckStatus => records
            .first()
            .map(|record| status_message(identifier, record))
            .ok_or_else(not_found),
    }
}
