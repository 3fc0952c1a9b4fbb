//! Message vocabulary shared by the host and worker channels.
//!
//! Inbound requests arrive as loosely-typed JSON and are classified with
//! [`Request::from_message`], so an unknown `type` or a missing field becomes a
//! [`RequestError`] rather than a decode failure. Outbound messages are the
//! typed [`Reply`] enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Appended to a query's text before the page context.
pub const QUERY_INSTRUCTION: &str = "Use context while answering - ";

/// Prepended to the page context of a summarize request.
pub const SUMMARIZE_INSTRUCTION: &str =
    "Rewrite the following website extract in human comprehensible concise form - ";

/// Messages sent toward the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Info {
        text: String,
    },

    Error {
        text: String,
    },

    /// One streamed word of a generation.
    #[serde(rename = "response")]
    Chunk {
        text: String,
        #[serde(rename = "isLast")]
        is_last: bool,
    },
}

impl Reply {
    pub fn info(text: impl Into<String>) -> Self {
        Self::Info { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Error { text: text.into() }
    }

    pub fn chunk(text: impl Into<String>, is_last: bool) -> Self {
        Self::Chunk {
            text: text.into(),
            is_last,
        }
    }

    pub fn is_last(&self) -> bool {
        matches!(self, Self::Chunk { is_last: true, .. })
    }
}

/// A validated generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Query { text: String, context: String },
    Summarize { context: String },
    Compose { text: String },
}

/// Why an inbound message was rejected. The display text is what the host sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("Error in parsing the input")]
    InvalidQuery { field: &'static str },

    #[error("Error in parsing the input")]
    InvalidSummarize { field: &'static str },

    #[error("Error in parsing the compose input")]
    InvalidCompose { field: &'static str },

    #[error("Error in parsing the message type")]
    UnknownType(Option<String>),
}

impl Request {
    /// Classify a decoded message by its `type` and check required fields.
    pub fn from_message(message: &Value) -> Result<Self, RequestError> {
        let kind = message.get("type").and_then(Value::as_str);
        match kind {
            Some("query") => {
                let text = required_field(message, "text")
                    .ok_or(RequestError::InvalidQuery { field: "text" })?;
                let context = required_field(message, "context")
                    .ok_or(RequestError::InvalidQuery { field: "context" })?;
                Ok(Self::Query { text, context })
            }
            Some("summarize") => {
                let context = required_field(message, "context")
                    .ok_or(RequestError::InvalidSummarize { field: "context" })?;
                Ok(Self::Summarize { context })
            }
            Some("compose") => {
                let text = required_field(message, "text")
                    .ok_or(RequestError::InvalidCompose { field: "text" })?;
                Ok(Self::Compose { text })
            }
            other => Err(RequestError::UnknownType(other.map(str::to_string))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::Summarize { .. } => "summarize",
            Self::Compose { .. } => "compose",
        }
    }

    /// The text handed to the generator.
    pub fn prompt(&self) -> String {
        match self {
            Self::Query { text, context } => format!("{text}{QUERY_INSTRUCTION}{context}"),
            Self::Summarize { context } => format!("{SUMMARIZE_INSTRUCTION}{context}"),
            Self::Compose { text } => text.clone(),
        }
    }
}

fn required_field(message: &Value, name: &str) -> Option<String> {
    message
        .get(name)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
