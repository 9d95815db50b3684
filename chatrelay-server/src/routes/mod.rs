//! HTTP route handlers for the relay.
//!
//! - `ws`: WebSocket endpoint clients submit prompts on
//! - `health`: Health check and metrics endpoints

pub mod health;
pub mod ws;

// Re-export handlers for convenience
pub use health::{health, live, metrics, metrics_prometheus};
pub use ws::ws_handler;
