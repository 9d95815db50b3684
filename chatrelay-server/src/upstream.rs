//! Upstream client for the Ollama chat endpoint.
//!
//! The relay talks to the upstream through the [`ChatBackend`] trait so the
//! dispatcher can be exercised against scripted backends in tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chatrelay_core::{ChatMessage, RelayError};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

/// Chunked upstream body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RelayError>> + Send>>;

/// Request body for POST /api/chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model name
    pub model: String,

    /// Chat messages, system instruction first
    pub messages: Vec<ChatMessage>,

    /// Always true for the relay
    pub stream: bool,
}

impl ChatRequest {
    /// Build a streaming request with `system_prompt` prepended to the history
    pub fn with_system_prompt(model: &str, system_prompt: &str, history: &[ChatMessage]) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend_from_slice(history);
        Self { model: model.to_string(), messages, stream: true }
    }
}

/// Something that can open a streaming chat call
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Establish the call and return its body.
    ///
    /// Fails with [`RelayError::UpstreamRejected`] on a non-success status and
    /// [`RelayError::UpstreamUnavailable`] when no response was obtained.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, RelayError>;
}

/// Limit on establishing the TCP connection to Ollama
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ollama HTTP client
#[derive(Clone)]
pub struct OllamaClient {
    /// HTTP client
    client: Client,
    /// Full chat endpoint URL
    url: String,
}

impl OllamaClient {
    /// Create a client for the chat endpoint at `url`.
    ///
    /// `idle_timeout` bounds the gap between reads, not the whole call, so a
    /// generation may stream for as long as tokens keep arriving.
    pub fn new(url: impl Into<String>, idle_timeout: Duration) -> Result<Self, RelayError> {
        let url = url.into();
        info!(url = %url, idle_timeout_secs = idle_timeout.as_secs(), "Creating Ollama client");

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(idle_timeout)
            .build()
            .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;

        Ok(Self { client, url })
    }

    /// Get the chat endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Check that the Ollama server answers at all
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), RelayError> {
        let url = tags_url(&self.url);
        debug!(url = %url, "Checking Ollama health");

        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                error!(status, body = %body, "Ollama returned error");
                Err(RelayError::rejected(status, body))
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to Ollama");
                Err(RelayError::UpstreamUnavailable(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    #[instrument(skip(self, request), fields(model = %request.model, messages = request.messages.len()))]
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, RelayError> {
        debug!(url = %self.url, "Sending streaming chat request");

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::rejected(status.as_u16(), body));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| RelayError::stream(e.to_string())));
        Ok(Box::pin(stream))
    }
}

/// `/api/tags` on the same host as the chat endpoint
fn tags_url(chat_url: &str) -> String {
    match chat_url.find("/api/") {
        Some(idx) => format!("{}/api/tags", &chat_url[..idx]),
        None => format!("{}/api/tags", chat_url.trim_end_matches('/')),
    }
}
