//! Prometheus metrics for the compile router.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry for router metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total requests counter with route kind and outcome labels
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("requests_total", "Total number of compilation requests")
            .namespace("compile_router"),
        &["route", "outcome"]
    ).expect("metric can be created");

    /// Waiters currently parked on a correlation id
    pub static ref INFLIGHT_WAITERS: Gauge = Gauge::with_opts(
        Opts::new("inflight_waiters", "Requests currently awaiting a correlated result")
            .namespace("compile_router")
    ).expect("metric can be created");

    /// Event bus connection status (1 = connected, 0 = disconnected)
    pub static ref BUS_CONNECTED: Gauge = Gauge::with_opts(
        Opts::new("bus_connected", "Event bus connection status (1=connected, 0=disconnected)")
            .namespace("compile_router")
    ).expect("metric can be created");

    /// Event bus reconnect attempts
    pub static ref BUS_RECONNECTS_TOTAL: Counter = Counter::with_opts(
        Opts::new("bus_reconnects_total", "Total event bus reconnect attempts")
            .namespace("compile_router")
    ).expect("metric can be created");

    /// Queue messages diverted to the object store
    pub static ref QUEUE_OVERFLOWS_TOTAL: Counter = Counter::with_opts(
        Opts::new("queue_overflows_total", "Queue messages overflowed to the object store")
            .namespace("compile_router")
    ).expect("metric can be created");

    /// Size of bodies returned from directly forwarded backends
    pub static ref FORWARDED_BODY_BYTES: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "forwarded_body_bytes",
            "Response body size for URL-routed requests"
        )
        .namespace("compile_router")
        .buckets(vec![1024.0, 16384.0, 65536.0, 262144.0, 1048576.0, 4194304.0])
    ).expect("metric can be created");
}

/// Register all metrics with the global registry.
/// Should be called once before starting the server.
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(INFLIGHT_WAITERS.clone()))?;
    REGISTRY.register(Box::new(BUS_CONNECTED.clone()))?;
    REGISTRY.register(Box::new(BUS_RECONNECTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_OVERFLOWS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FORWARDED_BODY_BYTES.clone()))?;
    Ok(())
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    encoder.encode_to_string(&families)
}

pub fn record_request(route: &str, outcome: &str) {
    REQUESTS_TOTAL.with_label_values(&[route, outcome]).inc();
}

pub fn set_bus_connected(connected: bool) {
    BUS_CONNECTED.set(if connected { 1.0 } else { 0.0 });
}
