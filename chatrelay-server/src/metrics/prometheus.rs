//! Prometheus metrics for the relay
//!
//! Exposes queue, stream and connection metrics in Prometheus text format.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry for relay metrics
    pub static ref REGISTRY: Registry = Registry::new();

    // ============== Request Metrics ==============

    /// Finished requests with model and outcome labels
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of relayed requests")
            .namespace("chatrelay"),
        &["model", "outcome"]
    ).expect("metric can be created");

    /// Time from dispatch to terminal outcome
    pub static ref REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "request_duration_seconds",
            "Streaming duration in seconds"
        )
        .namespace("chatrelay")
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
        &["model"]
    ).expect("metric can be created");

    /// Submissions rejected at admission, by reason
    pub static ref SUBMISSIONS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("submissions_rejected_total", "Total submissions rejected before queuing")
            .namespace("chatrelay"),
        &["reason"]
    ).expect("metric can be created");

    /// Content lines forwarded to clients
    pub static ref LINES_FORWARDED_TOTAL: Counter = Counter::with_opts(
        Opts::new("lines_forwarded_total", "Total upstream content lines forwarded")
            .namespace("chatrelay")
    ).expect("metric can be created");

    // ============== Queue Metrics ==============

    /// Current queue size gauge
    pub static ref QUEUE_SIZE: Gauge = Gauge::with_opts(
        Opts::new("queue_size", "Current number of requests waiting")
            .namespace("chatrelay")
    ).expect("metric can be created");

    /// Queue wait time histogram
    pub static ref QUEUE_WAIT_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "queue_wait_seconds",
            "Time spent waiting in queue"
        )
        .namespace("chatrelay")
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0])
    ).expect("metric can be created");

    /// Streams in flight (0 or 1)
    pub static ref ACTIVE_STREAMS: Gauge = Gauge::with_opts(
        Opts::new("active_streams", "Number of upstream streams in flight")
            .namespace("chatrelay")
    ).expect("metric can be created");

    // ============== Connection Metrics ==============

    /// Open WebSocket connections
    pub static ref OPEN_CONNECTIONS: Gauge = Gauge::with_opts(
        Opts::new("open_connections", "Number of open client connections")
            .namespace("chatrelay")
    ).expect("metric can be created");

    /// Connections dropped by the heartbeat
    pub static ref CONNECTIONS_TERMINATED_TOTAL: Counter = Counter::with_opts(
        Opts::new("connections_terminated_total", "Total connections terminated by heartbeat")
            .namespace("chatrelay")
    ).expect("metric can be created");

    // ============== Backend Metrics ==============

    /// Ollama backend health status (1 = healthy, 0 = unhealthy)
    pub static ref BACKEND_HEALTHY: Gauge = Gauge::with_opts(
        Opts::new("backend_healthy", "Backend health status (1=healthy, 0=unhealthy)")
            .namespace("chatrelay")
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(SUBMISSIONS_REJECTED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LINES_FORWARDED_TOTAL.clone()))?;

    REGISTRY.register(Box::new(QUEUE_SIZE.clone()))?;
    REGISTRY.register(Box::new(QUEUE_WAIT_SECONDS.clone()))?;
    REGISTRY.register(Box::new(ACTIVE_STREAMS.clone()))?;

    REGISTRY.register(Box::new(OPEN_CONNECTIONS.clone()))?;
    REGISTRY.register(Box::new(CONNECTIONS_TERMINATED_TOTAL.clone()))?;

    REGISTRY.register(Box::new(BACKEND_HEALTHY.clone()))?;

    Ok(())
}

/// Encode all metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Error encoding metrics: {}", e))
}

/// Record a finished request.
pub fn record_request(model: &str, outcome: &str, duration_secs: f64) {
    REQUESTS_TOTAL.with_label_values(&[model, outcome]).inc();
    REQUEST_DURATION_SECONDS
        .with_label_values(&[model])
        .observe(duration_secs);
}

/// Record a submission rejected at admission.
pub fn record_rejected(reason: &str) {
    SUBMISSIONS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
}

/// Record one forwarded content line.
pub fn record_line_forwarded() {
    LINES_FORWARDED_TOTAL.inc();
}

/// Update queue size gauge.
pub fn set_queue_size(size: usize) {
    QUEUE_SIZE.set(size as f64);
}

/// Record queue wait time.
pub fn record_queue_wait(wait_secs: f64) {
    QUEUE_WAIT_SECONDS.observe(wait_secs);
}

/// Mark whether a stream is in flight.
pub fn set_streaming(active: bool) {
    ACTIVE_STREAMS.set(if active { 1.0 } else { 0.0 });
}

/// Update open connections gauge.
pub fn set_open_connections(count: usize) {
    OPEN_CONNECTIONS.set(count as f64);
}

/// Record a connection dropped by the heartbeat.
pub fn record_connection_terminated() {
    CONNECTIONS_TERMINATED_TOTAL.inc();
}

/// Set backend health status.
pub fn set_backend_healthy(healthy: bool) {
    BACKEND_HEALTHY.set(if healthy { 1.0 } else { 0.0 });
}
