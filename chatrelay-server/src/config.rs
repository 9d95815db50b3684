//! Configuration for the relay server.
//!
//! Values come from defaults, then environment variables (`.env` is loaded by
//! the binary), then command-line flags.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

/// Instruction prepended to every conversation sent upstream
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer clearly and concisely.";

/// Relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Port to listen on
    pub port: u16,

    /// Full URL of the Ollama chat endpoint
    pub ollama_url: String,

    /// Origins allowed to open a WebSocket; `*` allows any
    pub allowed_origins: Vec<String>,

    /// System instruction prepended to each request
    pub system_prompt: String,

    /// Maximum number of waiting requests (0 = unbounded)
    pub max_queue: usize,

    /// Interval between liveness probes
    pub heartbeat_interval: Duration,

    /// Pause before draining the next request after one finishes
    pub retry_delay: Duration,

    /// Longest silence tolerated between upstream reads
    pub upstream_idle_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            ollama_url: "http://localhost:11434/api/chat".to_string(),
            allowed_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:4173".to_string(),
            ],
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_queue: 100,
            heartbeat_interval: Duration::from_secs(30),
            retry_delay: Duration::from_millis(10),
            upstream_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl RelayConfig {
    /// Create config from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(port) = env_parse("PORT") {
            config.port = port;
        }

        if let Ok(url) = std::env::var("OLLAMA_API_URL") {
            config.ollama_url = url;
        }

        if let Ok(origins) = std::env::var("RELAY_ALLOWED_ORIGINS") {
            config.allowed_origins = parse_origins(&origins);
        }

        if let Ok(path) = std::env::var("RELAY_SYSTEM_PROMPT_FILE") {
            config.load_system_prompt(Path::new(&path))?;
        } else if let Ok(prompt) = std::env::var("RELAY_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }

        if let Some(n) = env_parse("RELAY_MAX_QUEUE") {
            config.max_queue = n;
        }

        if let Some(secs) = env_parse("RELAY_HEARTBEAT_SECS") {
            config.heartbeat_interval = heartbeat_from_secs(secs);
        }

        if let Some(ms) = env_parse("RELAY_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = env_parse("RELAY_UPSTREAM_IDLE_SECS") {
            config.upstream_idle_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Replace the system prompt with the contents of a file
    pub fn load_system_prompt(&mut self, path: &Path) -> anyhow::Result<()> {
        let prompt = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read system prompt from {}", path.display()))?;
        self.system_prompt = prompt.trim_end().to_string();
        Ok(())
    }

    /// Whether a WebSocket handshake from `origin` may proceed
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return true;
        }
        match origin {
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
            None => false,
        }
    }
}

/// Split a comma-separated origin list, dropping blanks and trailing slashes
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Heartbeat interval for a number of seconds; zero is raised to one second
pub fn heartbeat_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
