use regex::Regex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::bigquery::StoreError;
use crate::slack::SignatureError;
use crate::types::SlackMessage;

pub const RETRY_MESSAGE: &str =
    "Sorry, the asset inventory is unavailable right now. Please try again in a moment.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `/getinfo <resource>`: instance details.
    GetInfo,
    /// `/checkstatus <resource>`: latest status check.
    CheckStatus,
}

impl CommandKind {
    pub fn from_command(command: &str) -> Option<Self> {
        match command.trim() {
            "/getinfo" => Some(Self::GetInfo),
            "/checkstatus" => Some(Self::CheckStatus),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetInfo => "/getinfo",
            Self::CheckStatus => "/checkstatus",
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] SignatureError),
    #[error("invalid input: {0}")]
    Validation(&'static str),
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("no record matched {identifier} for {}", .kind.name())]
    NotFound {
        kind: CommandKind,
        identifier: String,
    },
    #[error("asset store failure: {0}")]
    Upstream(#[from] StoreError),
}

impl CommandError {
    /// The message shown to the requesting user. Authentication failures never
    /// reach Slack as a message; the HTTP layer answers them with a bare 401.
    pub fn user_message(&self, command: &str) -> SlackMessage {
        match self {
            Self::Authentication(_) | Self::Validation(_) => SlackMessage::ephemeral(format!(
                "Sorry, I couldn't process that request. Usage: `{} my-resource`",
                command
            )),
            Self::UnknownCommand(name) if name.trim().is_empty() => {
                SlackMessage::ephemeral("Error: No command was provided.")
            }
            Self::UnknownCommand(name) => {
                SlackMessage::ephemeral(format!("Command '{}' not recognized.", name))
            }
            Self::NotFound {
                kind: CommandKind::GetInfo,
                identifier,
            } => SlackMessage::ephemeral(format!(
                "No information found for resource: *{}*.",
                identifier
            )),
            Self::NotFound {
                kind: CommandKind::CheckStatus,
                identifier,
            } => SlackMessage::ephemeral(format!(
                "❓ Resource *{}* was not found for status check.",
                identifier
            )),
            Self::Upstream(_) => SlackMessage::ephemeral(RETRY_MESSAGE),
        }
    }

    /// Logs the error at the level operators care about.
    pub fn log(&self) {
        match self {
            Self::Authentication(e) => warn!("Rejected request: {}", e),
            Self::Validation(_) | Self::UnknownCommand(_) => info!("Rejected input: {}", self),
            Self::NotFound { .. } => info!("{}", self),
            Self::Upstream(e) => error!("Lookup failed: {}", e),
        }
    }
}

/// Extracts the single identifier argument from a command's text.
///
/// The identifier is lowercased and must fully match `pattern`; nothing that
/// fails here ever reaches a query.
pub fn parse_identifier(text: &str, pattern: &Regex) -> Result<String, CommandError> {
    let mut parts = text.split_whitespace();
    let identifier = parts
        .next()
        .ok_or(CommandError::Validation("missing identifier"))?;
    if parts.next().is_some() {
        return Err(CommandError::Validation("expected a single identifier"));
    }

    let identifier = identifier.to_lowercase();
    if !pattern.is_match(&identifier) {
        return Err(CommandError::Validation("identifier outside allow-list"));
    }

    Ok(identifier)
}
