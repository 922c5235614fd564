use anyhow::{Context, Result};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::SdkMeterProvider, Resource};
use std::time::Duration;
use tracing::info;

/// Bridge telemetry metrics
pub struct BridgeMetrics {
    // Delivery
    pub delivery_latency: Histogram<f64>,
    pub delivery_failures: Counter<u64>,
    pub delivery_retries: Counter<u64>,
    pub verification_outcomes: Counter<u64>,

    // Session discovery
    pub cache_refresh_latency: Histogram<f64>,
    pub cache_refresh_failures: Counter<u64>,

    // Matching
    pub match_scan_latency: Histogram<f64>,

    // Auth and pairing
    pub auth_rejections: Counter<u64>,
    pub pairing_events: Counter<u64>,
}

impl BridgeMetrics {
    pub fn new(meter: &Meter) -> Self {
        let delivery_latency = meter
            .f64_histogram("talkie.bridge.delivery.latency_ms")
            .with_description("Message delivery latency in milliseconds")
            .build();

        let delivery_failures = meter
            .u64_counter("talkie.bridge.delivery.failures")
            .with_description("Deliveries that ended in an error")
            .build();

        let delivery_retries = meter
            .u64_counter("talkie.bridge.delivery.retries")
            .with_description("UI forwarding retries after connection failures")
            .build();

        let verification_outcomes = meter
            .u64_counter("talkie.bridge.delivery.verifications")
            .with_description("Transcript verification outcomes")
            .build();

        let cache_refresh_latency = meter
            .f64_histogram("talkie.bridge.sessions.refresh_ms")
            .with_description("Session discovery scan latency in milliseconds")
            .build();

        let cache_refresh_failures = meter
            .u64_counter("talkie.bridge.sessions.refresh_failures")
            .with_description("Session scans that failed and kept the stale list")
            .build();

        let match_scan_latency = meter
            .f64_histogram("talkie.bridge.match.scan_ms")
            .with_description("Terminal matching latency in milliseconds")
            .build();

        let auth_rejections = meter
            .u64_counter("talkie.bridge.auth.rejections")
            .with_description("Requests rejected by signature verification")
            .build();

        let pairing_events = meter
            .u64_counter("talkie.bridge.pairing.events")
            .with_description("Device pairing lifecycle transitions")
            .build();

        Self {
            delivery_latency,
            delivery_failures,
            delivery_retries,
            verification_outcomes,
            cache_refresh_latency,
            cache_refresh_failures,
            match_scan_latency,
            auth_rejections,
            pairing_events,
        }
    }

    pub fn record_delivery(&self, mode: &str, reason: &str, latency_ms: f64) {
        self.delivery_latency.record(
            latency_ms,
            &[
                KeyValue::new("mode", mode.to_string()),
                KeyValue::new("reason", reason.to_string()),
            ],
        );
    }

    pub fn record_delivery_failure(&self, mode: &str, kind: &str) {
        self.delivery_failures.add(
            1,
            &[
                KeyValue::new("mode", mode.to_string()),
                KeyValue::new("kind", kind.to_string()),
            ],
        );
    }

    pub fn record_delivery_retry(&self, attempt: u32) {
        self.delivery_retries
            .add(1, &[KeyValue::new("attempt", i64::from(attempt))]);
    }

    pub fn record_verification(&self, verified: bool, attempts: u32) {
        self.verification_outcomes.add(
            1,
            &[
                KeyValue::new("verified", verified.to_string()),
                KeyValue::new("attempts", i64::from(attempts)),
            ],
        );
    }

    pub fn record_cache_refresh(&self, latency_ms: f64, sessions: usize) {
        self.cache_refresh_latency.record(
            latency_ms,
            &[KeyValue::new("sessions", sessions as i64)],
        );
    }

    pub fn record_cache_refresh_failure(&self, reason: &str) {
        self.cache_refresh_failures
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_match_scan(&self, latency_ms: f64, matched: usize, unmatched: usize) {
        self.match_scan_latency.record(
            latency_ms,
            &[
                KeyValue::new("matched", matched as i64),
                KeyValue::new("unmatched", unmatched as i64),
            ],
        );
    }

    pub fn record_auth_rejection(&self, reason: &str) {
        self.auth_rejections
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
    }

    pub fn record_pairing_event(&self, transition: &str) {
        self.pairing_events
            .add(1, &[KeyValue::new("transition", transition.to_string())]);
    }
}

/// Initialize OTLP metrics export
pub fn init_metrics(
    endpoint: Option<String>,
    service_name: &str,
) -> Result<(SdkMeterProvider, BridgeMetrics)> {
    let endpoint = endpoint.unwrap_or_else(|| "http://localhost:4318".to_string());

    info!("Initializing OTLP telemetry: endpoint={}", endpoint);

    let export_config = opentelemetry_otlp::ExportConfig {
        endpoint: Some(endpoint.clone()),
        timeout: Duration::from_secs(10),
        ..Default::default()
    };

    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_http()
        .with_export_config(export_config)
        .build()
        .context("building OTLP metric exporter")?;

    let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(
        exporter,
        opentelemetry_sdk::runtime::Tokio,
    )
    .with_interval(Duration::from_secs(30))
    .build();

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());

    let meter = global::meter("talkie-bridge");
    let metrics = BridgeMetrics::new(&meter);

    info!("OTLP telemetry initialized");

    Ok((provider, metrics))
}

pub fn shutdown_metrics(provider: SdkMeterProvider) -> Result<()> {
    info!("Shutting down telemetry");
    provider
        .shutdown()
        .context("shutting down meter provider")?;
    Ok(())
}
