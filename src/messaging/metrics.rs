//! Prometheus metrics for publishing and dispatch

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

const NAMESPACE: &str = "storefront_dispatcher";

lazy_static! {
    /// Registry holding every dispatcher metric
    pub static ref DISPATCH_REGISTRY: Registry = Registry::new();

    /// Events handed to the broker
    ///
    /// Labels: kind
    pub static ref EVENTS_PUBLISHED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("events_published_total", "Total number of events published").namespace(NAMESPACE),
        &["kind"]
    ).expect("Failed to create EVENTS_PUBLISHED_TOTAL metric");

    /// Publish attempts that failed
    ///
    /// Labels: kind
    pub static ref PUBLISH_FAILURES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("publish_failures_total", "Total number of failed publishes").namespace(NAMESPACE),
        &["kind"]
    ).expect("Failed to create PUBLISH_FAILURES_TOTAL metric");

    /// Publish latency in seconds
    ///
    /// Labels: kind
    pub static ref PUBLISH_LATENCY_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("publish_latency_seconds", "Event publish latency in seconds")
            .namespace(NAMESPACE)
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["kind"]
    ).expect("Failed to create PUBLISH_LATENCY_SECONDS metric");

    /// Deliveries settled, by terminal outcome
    ///
    /// Labels: kind, outcome (acked, requeued, retried, dead_lettered, rejected)
    pub static ref MESSAGES_PROCESSED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("messages_processed_total", "Total number of deliveries settled").namespace(NAMESPACE),
        &["kind", "outcome"]
    ).expect("Failed to create MESSAGES_PROCESSED_TOTAL metric");

    /// Handler execution time in seconds
    ///
    /// Labels: kind
    pub static ref HANDLER_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("handler_duration_seconds", "Event handler duration in seconds")
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
        &["kind"]
    ).expect("Failed to create HANDLER_DURATION_SECONDS metric");

    /// Subscriptions currently consuming
    pub static ref ACTIVE_CONSUMERS: Gauge = Gauge::with_opts(
        Opts::new("active_consumers", "Number of active queue subscriptions").namespace(NAMESPACE)
    ).expect("Failed to create ACTIVE_CONSUMERS metric");

    /// 1 while a broker session is open
    pub static ref BROKER_CONNECTED: Gauge = Gauge::with_opts(
        Opts::new("broker_connected", "Whether a broker connection is established").namespace(NAMESPACE)
    ).expect("Failed to create BROKER_CONNECTED metric");
}

/// Register every metric with the dispatcher registry. Safe to call twice.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(EVENTS_PUBLISHED_TOTAL.clone()),
        Box::new(PUBLISH_FAILURES_TOTAL.clone()),
        Box::new(PUBLISH_LATENCY_SECONDS.clone()),
        Box::new(MESSAGES_PROCESSED_TOTAL.clone()),
        Box::new(HANDLER_DURATION_SECONDS.clone()),
        Box::new(ACTIVE_CONSUMERS.clone()),
        Box::new(BROKER_CONNECTED.clone()),
    ];

    for collector in collectors {
        match DISPATCH_REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Export registered metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&DISPATCH_REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
