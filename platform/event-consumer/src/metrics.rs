use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

const LABELS: &[&str] = &["service", "queue", "routing_key"];

/// Consumer pipeline metrics, labelled by service, queue and routing key
#[derive(Clone)]
pub struct ConsumerMetrics {
    pub events_consumed_total: IntCounterVec,
    pub events_processed_total: IntCounterVec,
    pub events_deduplicated_total: IntCounterVec,
    pub events_failed_total: IntCounterVec,
    pub events_retried_total: IntCounterVec,
    pub events_dead_lettered_total: IntCounterVec,
    pub events_unrouted_total: IntCounterVec,
    pub events_emit_failed_total: IntCounterVec,

    pub event_processing_duration_seconds: HistogramVec,
}

impl ConsumerMetrics {
    /// Create the metrics and register them in `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self {
            events_consumed_total: counter("events_consumed_total", "Deliveries received")?,
            events_processed_total: counter(
                "events_processed_total",
                "Events handled and committed",
            )?,
            events_deduplicated_total: counter(
                "events_deduplicated_total",
                "Deliveries skipped because the event was already processed",
            )?,
            events_failed_total: counter(
                "events_failed_total",
                "Handler, store or decode failures",
            )?,
            events_retried_total: counter(
                "events_retried_total",
                "Failed deliveries republished with an incremented retry count",
            )?,
            events_dead_lettered_total: counter(
                "events_dead_lettered_total",
                "Deliveries parked on the dead-letter queue",
            )?,
            events_unrouted_total: counter(
                "events_unrouted_total",
                "Deliveries acked without a registered handler",
            )?,
            events_emit_failed_total: counter(
                "events_emit_failed_total",
                "Downstream events that failed to publish after commit",
            )?,
            event_processing_duration_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "event_processing_duration_seconds",
                    "Time from delivery to terminal action",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
                LABELS,
            )?,
        };

        registry.register(Box::new(metrics.events_consumed_total.clone()))?;
        registry.register(Box::new(metrics.events_processed_total.clone()))?;
        registry.register(Box::new(metrics.events_deduplicated_total.clone()))?;
        registry.register(Box::new(metrics.events_failed_total.clone()))?;
        registry.register(Box::new(metrics.events_retried_total.clone()))?;
        registry.register(Box::new(metrics.events_dead_lettered_total.clone()))?;
        registry.register(Box::new(metrics.events_unrouted_total.clone()))?;
        registry.register(Box::new(metrics.events_emit_failed_total.clone()))?;
        registry.register(Box::new(metrics.event_processing_duration_seconds.clone()))?;

        Ok(metrics)
    }
}

fn counter(name: &str, help: &str) -> Result<IntCounterVec, prometheus::Error> {
    IntCounterVec::new(Opts::new(name, help), LABELS)
}

/// Render `registry` in the Prometheus text format
pub fn render(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
