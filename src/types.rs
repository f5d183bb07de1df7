use serde::{Deserialize, Serialize};

/// Form body Slack posts for a slash command.
#[derive(Debug, Default, Deserialize)]
pub struct SlashCommand {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub response_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Ephemeral,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlackMessage {
    pub response_type: ResponseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<Block>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replace_original: bool,
}

impl SlackMessage {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Ephemeral,
            text: Some(text.into()),
            blocks: Vec::new(),
            replace_original: false,
        }
    }

    /// Blocks plus a plain fallback used by notifications.
    pub fn with_blocks(fallback: impl Into<String>, blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            ..Self::ephemeral(fallback)
        }
    }

    /// Marks the message as replacing the acknowledgement it follows up on.
    pub fn replacing_original(self) -> Self {
        Self {
            replace_original: true,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Section { text: TextObject },
    Actions { elements: Vec<Button> },
    Context { elements: Vec<TextObject> },
    Divider,
}

impl Block {
    pub fn markdown_section(text: impl Into<String>) -> Self {
        Block::Section {
            text: TextObject::Markdown { text: text.into() },
        }
    }

    pub fn context(text: impl Into<String>) -> Self {
        Block::Context {
            elements: vec![TextObject::Markdown { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TextObject {
    #[serde(rename = "mrkdwn")]
    Markdown { text: String },
    #[serde(rename = "plain_text")]
    Plain { text: String, emoji: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Button {
    #[serde(rename = "type")]
    kind: &'static str,
    pub text: TextObject,
    pub url: String,
}

impl Button {
    pub fn link(label: &str, url: String) -> Self {
        Self {
            kind: "button",
            text: TextObject::Plain {
                text: label.to_string(),
                emoji: true,
            },
            url,
        }
    }
}
