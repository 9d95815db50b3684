//! chatrelay server library
//!
//! WebSocket front-end for a single Ollama instance. Any number of clients
//! may submit chat requests; they are queued FIFO, streamed upstream one at a
//! time, and every waiting client is kept informed of its queue position.
//!
//! The binary in `main.rs` is a thin wrapper around [`run_server`].

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod config;
pub mod dispatcher;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod state;
pub mod upstream;

pub use config::RelayConfig;
pub use dispatcher::{Dispatcher, DispatcherSnapshot};
pub use registry::ConnectionRegistry;
pub use relay::{RelayOutcome, StreamRelay};
pub use state::AppState;
pub use upstream::{ChatBackend, ChatRequest, OllamaClient};

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the HTTP router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Client endpoint
        .route("/", get(routes::ws_handler))
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/live", get(routes::live))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the relay server until Ctrl+C / SIGTERM.
///
/// # Example
/// ```no_run
/// use chatrelay_server::{run_server, RelayConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = RelayConfig { port: 3000, ..Default::default() };
///     run_server(config, false).await
/// }
/// ```
pub async fn run_server(config: RelayConfig, print_banner: bool) -> anyhow::Result<()> {
    init_metrics();

    info!(
        port = config.port,
        ollama_url = %config.ollama_url,
        "Starting chatrelay v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = Arc::new(AppState::new(config.clone())?);

    // Check Ollama connectivity
    match state.ollama().health_check().await {
        Ok(_) => {
            metrics::set_backend_healthy(true);
            info!("Connected to Ollama at {}", config.ollama_url);
        }
        Err(e) => {
            metrics::set_backend_healthy(false);
            warn!(
                "Could not connect to Ollama at {}: {}. \
                 Relay will start anyway; requests fail until it is reachable.",
                config.ollama_url, e
            );
        }
    }

    let heartbeat =
        heartbeat::spawn_heartbeat(Arc::clone(&state.registry), config.heartbeat_interval);

    let app = build_router(Arc::clone(&state));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("chatrelay listening on ws://{}", addr);
    info!("Health:     http://{}/health", addr);

    if print_banner {
        print_banner_text(&config);
    }

    let registry = Arc::clone(&state.registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            registry.clear();
        })
        .await?;

    heartbeat.abort();
    info!("chatrelay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting graceful shutdown"),
        _ = terminate => info!("Received terminate signal, starting graceful shutdown"),
    }
}

/// Print the startup banner
fn print_banner_text(config: &RelayConfig) {
    let addr = format!("0.0.0.0:{}", config.port);

    println!();
    println!("==================================================");
    println!("  chatrelay v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: ws://{}", addr);
    println!("  Ollama chat endpoint: {}", config.ollama_url);
    println!("  Allowed origins: {}", config.allowed_origins.join(", "));
    println!();
    println!("  Queue:");
    if config.max_queue == 0 {
        println!("    Max waiting: unbounded");
    } else {
        println!("    Max waiting: {}", config.max_queue);
    }
    println!("    Heartbeat: every {}s", config.heartbeat_interval.as_secs());
    println!("    Upstream idle timeout: {}s", config.upstream_idle_timeout.as_secs());
    println!();
    println!("  Endpoints:");
    println!("    Chat:   GET  / (WebSocket)");
    println!("    Health: GET  /health, /live, /metrics");
    println!("    Prometheus: GET /metrics/prometheus");
    println!("==================================================");
    println!();
}
