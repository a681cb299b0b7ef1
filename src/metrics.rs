//! Prometheus instrumentation for consumers and replicators.

use prometheus::{IntCounter, IntGauge};

/// Counters and gauges registered on the default registry.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Total messages delivered to the caller.
    pub messages_received_total: IntCounter,
    /// Total messages acked as durably processed.
    pub messages_acked_total: IntCounter,
    /// Total messages routed to an error queue.
    pub messages_dead_lettered_total: IntCounter,
    /// Total messages whose processing failed.
    pub messages_failed_total: IntCounter,
    /// Consumer health status (1 = healthy, 0 = unhealthy).
    pub consumer_healthy: IntGauge,
    /// Current consecutive receive-error count (resets on success).
    pub consecutive_errors: IntGauge,
    /// Current backoff duration in seconds.
    pub backoff_seconds: IntGauge,
}

impl RelayMetrics {
    pub fn new() -> Self {
        let registry = prometheus::default_registry();

        let messages_received_total = IntCounter::new(
            "relay_messages_received_total",
            "Total number of messages delivered to the caller",
        )
        .expect("valid metric for relay_messages_received_total");

        let messages_acked_total = IntCounter::new(
            "relay_messages_acked_total",
            "Total number of messages acked as durably processed",
        )
        .expect("valid metric for relay_messages_acked_total");

        let messages_dead_lettered_total = IntCounter::new(
            "relay_messages_dead_lettered_total",
            "Total number of messages routed to an error queue",
        )
        .expect("valid metric for relay_messages_dead_lettered_total");

        let messages_failed_total = IntCounter::new(
            "relay_messages_failed_total",
            "Total number of messages whose processing failed",
        )
        .expect("valid metric for relay_messages_failed_total");

        let consumer_healthy = IntGauge::new(
            "relay_consumer_healthy",
            "Consumer health status (1 = healthy, 0 = unhealthy)",
        )
        .expect("valid metric for relay_consumer_healthy");

        let consecutive_errors = IntGauge::new(
            "relay_consumer_consecutive_errors",
            "Current number of consecutive receive errors",
        )
        .expect("valid metric for relay_consumer_consecutive_errors");

        let backoff_seconds = IntGauge::new(
            "relay_consumer_backoff_seconds",
            "Current backoff duration in seconds",
        )
        .expect("valid metric for relay_consumer_backoff_seconds");

        for metric in [
            Box::new(messages_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_acked_total.clone()),
            Box::new(messages_dead_lettered_total.clone()),
            Box::new(messages_failed_total.clone()),
            Box::new(consumer_healthy.clone()),
            Box::new(consecutive_errors.clone()),
            Box::new(backoff_seconds.clone()),
        ] {
            let _ = registry.register(metric);
        }

        consumer_healthy.set(1);

        Self {
            messages_received_total,
            messages_acked_total,
            messages_dead_lettered_total,
            messages_failed_total,
            consumer_healthy,
            consecutive_errors,
            backoff_seconds,
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
