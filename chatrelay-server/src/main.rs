//! chatrelay - WebSocket queue and streaming relay in front of Ollama.
//!
//! Many browser clients share one Ollama instance that serves one chat at a
//! time. Clients submit over a WebSocket, wait in a FIFO queue with live
//! position updates, and receive the upstream NDJSON stream as it arrives.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (port 3000, Ollama at localhost:11434)
//! chatrelay
//!
//! # Custom configuration
//! OLLAMA_API_URL=http://192.168.1.100:11434/api/chat PORT=9000 chatrelay
//! chatrelay --allowed-origin https://chat.example.com --max-queue 20
//! ```

use std::path::PathBuf;

use chatrelay_server::config::{heartbeat_from_secs, parse_origins};
use chatrelay_server::{run_server, RelayConfig};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(version)]
#[command(about = "Queue and stream chat requests to a single Ollama instance", long_about = None)]
struct Args {
    /// Port to listen on [env: PORT]
    #[arg(short, long)]
    port: Option<u16>,

    /// Ollama chat endpoint URL [env: OLLAMA_API_URL]
    #[arg(long)]
    ollama_url: Option<String>,

    /// Origin allowed to connect, repeatable or comma separated; `*` allows any
    /// [env: RELAY_ALLOWED_ORIGINS]
    #[arg(long = "allowed-origin")]
    allowed_origins: Vec<String>,

    /// File holding the system prompt [env: RELAY_SYSTEM_PROMPT_FILE]
    #[arg(long)]
    system_prompt_file: Option<PathBuf>,

    /// Maximum waiting requests, 0 for unbounded [env: RELAY_MAX_QUEUE]
    #[arg(long)]
    max_queue: Option<usize>,

    /// Seconds between liveness probes [env: RELAY_HEARTBEAT_SECS]
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Do not print the startup banner
    #[arg(long)]
    quiet: bool,
}

impl Args {
    /// Apply command-line overrides on top of the environment
    fn apply(self, config: &mut RelayConfig) -> anyhow::Result<()> {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = self.ollama_url {
            config.ollama_url = url;
        }
        if !self.allowed_origins.is_empty() {
            config.allowed_origins =
                self.allowed_origins.iter().flat_map(|raw| parse_origins(raw)).collect();
        }
        if let Some(path) = &self.system_prompt_file {
            config.load_system_prompt(path)?;
        }
        if let Some(max) = self.max_queue {
            config.max_queue = max;
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_interval = heartbeat_from_secs(secs);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("chatrelay_server=info,tower_http=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Load configuration
    let print_banner = !args.quiet;
    let mut config = RelayConfig::from_env()?;
    args.apply(&mut config)?;

    run_server(config, print_banner).await
}
