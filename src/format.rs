use time::macros::format_description;
use time::OffsetDateTime;

use crate::bigquery::AssetRecord;
use crate::types::{Block, Button, SlackMessage};

const MISSING: &str = "N/A";
const DETAILS_LIMIT: usize = 1000;

/// Formats a BigQuery TIMESTAMP cell (epoch seconds, possibly in exponent
/// notation) as `DD-MM-YYYY at HH:MM UTC`. Values that don't parse are shown
/// as-is.
pub fn format_timestamp(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return "Not available".to_string();
    };

    let parsed = raw
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs.trunc() as i64).ok());

    let format = format_description!("[day]-[month]-[year] at [hour]:[minute] UTC");
    parsed
        .and_then(|dt| dt.format(&format).ok())
        .unwrap_or_else(|| raw.to_string())
}

/// Link to the instance in the Cloud Console, when zone, name and project are
/// all known. Asset exports sometimes carry the zone as a resource path.
pub fn console_url(record: &AssetRecord) -> Option<String> {
    let zone = record.get("zone")?.rsplit('/').next()?;
    let name = record.get("instance_name")?;
    let project = record.get("project_id")?;
    Some(format!(
        "https://console.cloud.google.com/compute/instancesDetail/zones/{}/instances/{}?project={}",
        urlencoding::encode(zone),
        urlencoding::encode(name),
        urlencoding::encode(project)
    ))
}

fn field<'a>(record: &'a AssetRecord, name: &str) -> &'a str {
    record.get(name).unwrap_or(MISSING)
}

fn instance_section(record: &AssetRecord) -> String {
    format!(
        "ℹ️ Information for *{}* (ID: *{}*):\n   • Project: *{}*\n   • Status: *{}*\n   • Zone: *{}*\n   • Machine Type: *{}*\n   • Created/Updated: _{}_",
        field(record, "instance_name"),
        field(record, "instance_id"),
        field(record, "project_id"),
        field(record, "status"),
        field(record, "zone"),
        field(record, "machine_type"),
        format_timestamp(record.get("creation_timestamp")),
    )
}

/// Renders matched instances, one section per record, keeping at most
/// `max_records` of them.
pub fn instance_message(
    identifier: &str,
    records: &[AssetRecord],
    max_records: usize,
) -> SlackMessage {
    let shown = &records[..records.len().min(max_records)];
    let mut blocks = Vec::with_capacity(shown.len() * 3 + 1);

    for (i, record) in shown.iter().enumerate() {
        if i > 0 {
            blocks.push(Block::Divider);
        }
        blocks.push(Block::markdown_section(instance_section(record)));
        if let Some(url) = console_url(record) {
            blocks.push(Block::Actions {
                elements: vec![Button::link("🔗 Open in GCP Console", url)],
            });
        }
    }

    if records.len() > shown.len() {
        blocks.push(Block::context(format!(
            "Showing the first {} matches for *{}*. Use a more specific name or the instance ID to narrow it down.",
            shown.len(),
            identifier
        )));
    }

    SlackMessage::with_blocks(
        format!("Information for {} ({} match(es))", identifier, shown.len()),
        blocks,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Favorable,
    InProgress,
    NeedsAttention,
}

pub fn classify_status(status: Option<&str>) -> StatusClass {
    let status = status.unwrap_or("unknown").to_lowercase();
    if ["active", "ok", "complete"].iter().any(|s| status.contains(s)) {
        StatusClass::Favorable
    } else if ["pending", "in progress"].iter().any(|s| status.contains(s)) {
        StatusClass::InProgress
    } else {
        StatusClass::NeedsAttention
    }
}

fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Renders the status-check row for a resource.
pub fn status_message(identifier: &str, record: &AssetRecord) -> SlackMessage {
    let name = record.get("item_name").unwrap_or(identifier);
    let status = record.get("current_status");
    let shown_status = status.unwrap_or(MISSING);

    let (emoji, headline) = match classify_status(status) {
        StatusClass::Favorable => (
            "✅",
            format!("Resource *{}* has a favorable status: *{}*.", name, shown_status),
        ),
        StatusClass::InProgress => (
            "⏳",
            format!("Resource *{}* has status: *{}*.", name, shown_status),
        ),
        StatusClass::NeedsAttention => (
            "❌",
            format!(
                "Resource *{}* requires attention. Status: *{}*.",
                name, shown_status
            ),
        ),
    };

    let details = record
        .get("details")
        .map(|d| truncate(d, DETAILS_LIMIT))
        .unwrap_or_else(|| "No additional details.".to_string());

    SlackMessage::ephemeral(format!(
        "{} {}\n   • Details: _{}_\n   • Last checked: _{}_",
        emoji,
        headline,
        details,
        format_timestamp(record.get("last_checked"))
    ))
}
