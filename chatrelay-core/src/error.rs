//! Error types for the chatrelay core library
//!
//! Every failure is local to a single request: nothing here is fatal to the
//! relay process.
//!
//! # Error Hierarchy
//!
//! ```text
//! RelayError
//! ├── admission  - InvalidJson, InvalidPayload, QueueFull (never enqueued)
//! ├── upstream   - UpstreamUnavailable, UpstreamRejected, UpstreamReported, UpstreamStream
//! └── transport  - TransportGone (owning connection closed, nothing to report to)
//! ```

use thiserror::Error;

/// Client-facing text for frames that are not JSON at all.
pub const INVALID_JSON_MESSAGE: &str = "Invalid JSON format";

/// Client-facing text for submissions missing `id`, `model` or `messages`.
pub const MISSING_PARAMETERS_MESSAGE: &str =
    "Missing required parameters: id, model, and messages array";

/// Client-facing text when the upstream call could not be carried out.
pub const STREAMING_FAILED_MESSAGE: &str = "Error occurred during streaming";

/// Client-facing text when reading the upstream body fails mid-stream.
pub const STREAM_READ_FAILED_MESSAGE: &str = "Stream reading error occurred";

/// Errors raised while admitting or relaying a chat request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The inbound frame is not valid JSON
    #[error("Invalid JSON format")]
    InvalidJson,

    /// The inbound object lacks a required field or has the wrong shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The waiting list is at capacity
    #[error("Queue is full (max: {max})")]
    QueueFull { max: usize },

    /// The upstream call could not be established
    #[error("Failed to reach Ollama: {0}")]
    UpstreamUnavailable(String),

    /// The upstream answered with a non-success status
    #[error("Ollama API error ({status}): {body}")]
    UpstreamRejected { status: u16, body: String },

    /// The upstream stream carried an `error` field
    #[error("{0}")]
    UpstreamReported(String),

    /// Reading the upstream body failed after streaming started
    #[error("Stream reading error: {0}")]
    UpstreamStream(String),

    /// The owning connection is no longer open
    #[error("Client connection is gone")]
    TransportGone,
}

impl RelayError {
    /// Create an invalid payload error
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create an upstream rejection error
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::UpstreamRejected { status, body: body.into() }
    }

    /// Create a mid-stream read error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::UpstreamStream(msg.into())
    }

    /// Text sent to the client in a `{type:"error"}` message.
    ///
    /// Returns `None` for [`RelayError::TransportGone`]: there is nobody left to tell.
    pub fn client_message(&self) -> Option<String> {
        match self {
            Self::InvalidJson => Some(INVALID_JSON_MESSAGE.to_string()),
            Self::InvalidPayload(_) => Some(MISSING_PARAMETERS_MESSAGE.to_string()),
            Self::QueueFull { .. } | Self::UpstreamRejected { .. } | Self::UpstreamReported(_) => {
                Some(self.to_string())
            }
            Self::UpstreamUnavailable(_) => Some(STREAMING_FAILED_MESSAGE.to_string()),
            Self::UpstreamStream(_) => Some(STREAM_READ_FAILED_MESSAGE.to_string()),
            Self::TransportGone => None,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::QueueFull { .. } => "queue_full",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::UpstreamReported(_) => "upstream_reported",
            Self::UpstreamStream(_) => "upstream_stream",
            Self::TransportGone => "transport_gone",
        }
    }
}
