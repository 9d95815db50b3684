//! Metrics module for the relay
//!
//! Provides Prometheus metrics for monitoring and observability.

pub mod prometheus;

// Re-export commonly used items
pub use prometheus::{
    encode_metrics, record_connection_terminated, record_line_forwarded, record_queue_wait,
    record_rejected, record_request, register_metrics, set_backend_healthy, set_open_connections,
    set_queue_size, set_streaming,
};
