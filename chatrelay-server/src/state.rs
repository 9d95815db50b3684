//! Application state for the relay server.

use std::sync::Arc;
use std::time::Instant;

use chatrelay_core::RelayError;

use crate::config::RelayConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::ConnectionRegistry;
use crate::relay::StreamRelay;
use crate::upstream::OllamaClient;

/// Application state shared across all handlers
pub struct AppState {
    /// Configuration
    pub config: RelayConfig,

    /// Open client connections
    pub registry: Arc<ConnectionRegistry>,

    /// Queue and processing gate in front of Ollama
    pub dispatcher: Arc<Dispatcher<OllamaClient>>,

    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        let registry = Arc::new(ConnectionRegistry::new());
        let client = OllamaClient::new(config.ollama_url.clone(), config.upstream_idle_timeout)?;
        let relay = StreamRelay::new(client, Arc::clone(&registry), config.system_prompt.clone());
        let dispatcher =
            Dispatcher::new(relay, Arc::clone(&registry), config.max_queue, config.retry_delay);

        Ok(Self { config, registry, dispatcher, started_at: Instant::now() })
    }

    /// The upstream client
    pub fn ollama(&self) -> &OllamaClient {
        self.dispatcher.relay().backend()
    }
}
