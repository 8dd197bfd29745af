//! Prometheus metrics for the event bridge.
//!
//! The surface is an explicitly constructed registry shared by `Arc` rather
//! than a set of process globals, so tests get a fresh registry each time.

use anyhow::{Context, Result};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Drop reason label: upstream body was not valid JSON
pub const DROP_DECODE: &str = "decode_error";
/// Drop reason label: envelope carried no usable event id
pub const DROP_MISSING_ID: &str = "missing_id";

pub struct Metrics {
    registry: Registry,

    /// Events decoded successfully from the upstream queue
    pub events_consumed_total: IntCounter,
    /// Records durably acknowledged by the downstream log
    pub events_published_total: IntCounter,
    /// Publish retry iterations across all events
    pub retry_attempts_total: IntCounter,
    /// Events whose publish retries were exhausted
    pub dead_letter_total: IntCounter,
    /// Deliveries dropped before processing, by reason
    pub events_dropped_total: IntCounterVec,
    /// Wall time of one processing pass per event
    pub processing_duration_seconds: Histogram,
    /// Events currently inside the processor
    pub in_flight_events: IntGauge,
    /// Breaker state by name (0 = closed, 1 = open, 2 = half-open)
    pub circuit_breaker_state: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let events_consumed_total = IntCounter::new(
            "events_consumed_total",
            "The total number of events consumed from RabbitMQ",
        )?;
        let events_published_total = IntCounter::new(
            "events_published_total",
            "The total number of events published to Kafka",
        )?;
        let retry_attempts_total = IntCounter::new(
            "retry_attempts_total",
            "The total number of retry attempts",
        )?;
        let dead_letter_total = IntCounter::new(
            "dead_letter_total",
            "The total number of events whose publish retries were exhausted",
        )?;
        let events_dropped_total = IntCounterVec::new(
            Opts::new(
                "events_dropped_total",
                "The total number of deliveries dropped before processing",
            ),
            &["reason"],
        )?;
        let processing_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "processing_duration_seconds",
            "Duration of event processing",
        ))?;
        let in_flight_events = IntGauge::new(
            "in_flight_events",
            "The number of events currently being processed",
        )?;
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "State of the circuit breaker (0: closed, 1: open, 2: half-open)",
            ),
            &["name"],
        )?;

        registry.register(Box::new(events_consumed_total.clone()))?;
        registry.register(Box::new(events_published_total.clone()))?;
        registry.register(Box::new(retry_attempts_total.clone()))?;
        registry.register(Box::new(dead_letter_total.clone()))?;
        registry.register(Box::new(events_dropped_total.clone()))?;
        registry.register(Box::new(processing_duration_seconds.clone()))?;
        registry.register(Box::new(in_flight_events.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Arc::new(Self {
            registry,
            events_consumed_total,
            events_published_total,
            retry_attempts_total,
            dead_letter_total,
            events_dropped_total,
            processing_duration_seconds,
            in_flight_events,
            circuit_breaker_state,
        }))
    }

    /// Encode every registered metric in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("failed to encode metrics")?;

        String::from_utf8(buffer).context("metrics output is not valid utf-8")
    }
}
