//! Wire protocol between WebSocket clients and the relay.
//!
//! Inbound, one JSON object per submission:
//!
//! ```text
//! { "id": "...", "model": "...", "messages": [{ "role": "user", "content": "..." }] }
//! ```
//!
//! Outbound, tagged by `type` (`queue`, `done`, `error`), plus raw upstream
//! lines which are forwarded untouched and therefore never modelled here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message of the conversation history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Any other fields (`images`, `tool_calls`, ...), passed upstream as-is
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self { role, content: content.into(), extra: Map::new() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A validated client submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Caller-supplied correlation id
    pub id: String,
    /// Target model identifier
    pub model: String,
    /// Conversation history, already windowed by the caller
    pub messages: Vec<ChatMessage>,
}

impl Submission {
    /// Parse and validate one inbound text frame.
    ///
    /// Non-JSON input yields [`RelayError::InvalidJson`]; a JSON value missing
    /// `id` or `model`, or whose `messages` is not an array of role/content
    /// objects, yields [`RelayError::InvalidPayload`].
    pub fn parse(frame: &str) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_str(frame).map_err(|_| RelayError::InvalidJson)?;

        let id = correlation_id(value.get("id"))
            .ok_or_else(|| RelayError::invalid_payload("missing id"))?;

        let model = match value.get("model") {
            Some(Value::String(model)) if !model.is_empty() => model.clone(),
            _ => return Err(RelayError::invalid_payload("missing model")),
        };

        let messages = match value.get("messages") {
            Some(Value::Array(items)) => items
                .iter()
                .map(ChatMessage::deserialize)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| RelayError::invalid_payload(format!("bad message: {}", e)))?,
            _ => return Err(RelayError::invalid_payload("messages must be an array")),
        };

        Ok(Self { id, model, messages })
    }
}

/// Correlation ids may arrive as strings or numbers; empty and zero are absent.
fn correlation_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// Messages the relay itself produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Queue position update for a waiting request
    Queue {
        position: usize,
        length: usize,
        #[serde(rename = "isSomeoneProcessing")]
        is_someone_processing: bool,
    },
    /// The stream for this connection's request is complete
    Done,
    /// Terminal failure for this connection's request
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    /// Error message for a relay failure, if it is reportable
    pub fn from_error(err: &RelayError) -> Option<Self> {
        err.client_message().map(Self::error)
    }

    /// Serialize to the JSON text sent over the socket
    pub fn to_json(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json,
            // Plain enum of strings and integers; serialization cannot fail.
            Err(_) => String::from(r#"{"type":"error","message":"internal error"}"#),
        }
    }
}
