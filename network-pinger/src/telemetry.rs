//! Pinger metrics.
//!
//! Every [`PingerMetrics`] owns its own `SdkMeterProvider`. The provider
//! always has a Prometheus reader writing into a private registry, which
//! backs the `/metrics` endpoint. An OTLP reader is added when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//!
//! Nothing is registered globally, so several instances can coexist.

use anyhow::{Context, Result};
use log::{info, warn};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter, MeterProvider as _};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{
    Aggregation, Instrument, PeriodicReader, SdkMeterProvider, Stream, View, new_view,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::time::Duration;

use crate::settings::Identity;

/// OTLP push interval in seconds
const METRIC_EXPORT_INTERVAL_SECS: u64 = 30;

const CHECK_LATENCY_BUCKETS: [f64; 11] = [
    2.0, 5.0, 10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0,
];
const PING_LATENCY_BUCKETS: [f64; 7] = [0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];

/// Result of one ping exchange, as recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingSample {
    /// Average round trip, absent when nothing came back.
    pub latency_ms: Option<f64>,
    pub lost: u64,
    pub total: u64,
}

/// Healthy/unhealthy gauges plus a latency histogram for one kind of check.
struct CheckInstruments {
    healthy: Gauge<u64>,
    unhealthy: Gauge<u64>,
    latency_ms: Histogram<f64>,
}

impl CheckInstruments {
    fn new(meter: &Meter, prefix: &str, subject: &str) -> Self {
        Self {
            healthy: meter
                .u64_gauge(format!("{}_healthy", prefix))
                .with_description(format!("If the {} request is healthy on this node", subject))
                .build(),
            unhealthy: meter
                .u64_gauge(format!("{}_unhealthy", prefix))
                .with_description(format!(
                    "If the {} request is unhealthy on this node",
                    subject
                ))
                .build(),
            latency_ms: meter
                .f64_histogram(format!("{}_latency_ms", prefix))
                .with_description(format!(
                    "The latency ms histogram the node request {}",
                    subject
                ))
                .build(),
        }
    }

    fn set_healthy(&self, node_name: &str, latency_ms: f64) {
        let attrs = [KeyValue::new("nodeName", node_name.to_string())];
        self.healthy.record(1, &attrs);
        self.latency_ms.record(latency_ms, &attrs);
        self.unhealthy.record(0, &attrs);
    }

    fn set_unhealthy(&self, node_name: &str) {
        let attrs = [KeyValue::new("nodeName", node_name.to_string())];
        self.healthy.record(0, &attrs);
        self.unhealthy.record(1, &attrs);
    }
}

/// Latency histogram plus lost/total counters for one kind of ping.
///
/// Note: Do NOT add _total suffix to Counter names (Prometheus adds it automatically)
struct PingInstruments {
    latency_ms: Histogram<f64>,
    lost: Counter<u64>,
    total: Counter<u64>,
}

impl PingInstruments {
    fn new(meter: &Meter, prefix: &str, subject: &str) -> Self {
        Self {
            latency_ms: meter
                .f64_histogram(format!("{}_latency_ms", prefix))
                .with_description(format!("The latency ms histogram for {}", subject))
                .build(),
            lost: meter
                .u64_counter(format!("{}_lost", prefix))
                .with_description(format!("The lost count for {}", subject))
                .build(),
            total: meter
                .u64_counter(format!("{}_count", prefix))
                .with_description(format!("The total count for {}", subject))
                .build(),
        }
    }

    fn record(&self, attrs: &[KeyValue], sample: PingSample) {
        if let Some(latency_ms) = sample.latency_ms {
            self.latency_ms.record(latency_ms, attrs);
        }
        self.lost.add(sample.lost, attrs);
        self.total.add(sample.total, attrs);
    }
}

pub struct PingerMetrics {
    registry: Registry,
    provider: SdkMeterProvider,
    /// src_node_name, src_node_ip, src_pod_ip
    source: [KeyValue; 3],
    apiserver: CheckInstruments,
    internal_dns: CheckInstruments,
    external_dns: CheckInstruments,
    pod_ping: PingInstruments,
    node_ping: PingInstruments,
    ip_ping: PingInstruments,
}

impl PingerMetrics {
    /// Register all instruments. `otlp_endpoint` adds a push exporter.
    pub fn new(identity: &Identity, otlp_endpoint: Option<String>) -> Result<Self> {
        let registry = Registry::new();
        let prometheus_exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .without_scope_info()
            .without_target_info()
            .without_units()
            .build()
            .context("Failed to create Prometheus exporter")?;

        let resource = Resource::default().merge(&Resource::new(vec![
            KeyValue::new("service.name", "network-pinger"),
            KeyValue::new("telemetry.sdk.language", "rust"),
        ]));

        let mut builder = SdkMeterProvider::builder()
            .with_reader(prometheus_exporter)
            .with_resource(resource)
            .with_view(latency_view("pinger_apiserver_latency_ms", &CHECK_LATENCY_BUCKETS)?)
            .with_view(latency_view("pinger_*_dns_latency_ms", &CHECK_LATENCY_BUCKETS)?)
            .with_view(latency_view("pinger_*_ping_latency_ms", &PING_LATENCY_BUCKETS)?);

        if let Some(endpoint) = otlp_endpoint {
            info!("OTLP endpoint: {}", endpoint);
            builder = builder.with_reader(otlp_reader(&endpoint)?);
        }

        let provider = builder.build();
        let meter = provider.meter("network-pinger");

        Ok(Self {
            source: [
                KeyValue::new("src_node_name", identity.node_name.clone()),
                KeyValue::new("src_node_ip", identity.host_ip.clone()),
                KeyValue::new("src_pod_ip", identity.pod_ip.clone()),
            ],
            apiserver: CheckInstruments::new(&meter, "pinger_apiserver", "apiserver"),
            internal_dns: CheckInstruments::new(&meter, "pinger_internal_dns", "internal dns"),
            external_dns: CheckInstruments::new(&meter, "pinger_external_dns", "external dns"),
            pod_ping: PingInstruments::new(&meter, "pinger_pod_ping", "pod peer ping"),
            node_ping: PingInstruments::new(&meter, "pinger_node_ping", "pod ping node"),
            ip_ping: PingInstruments::new(&meter, "pinger_ip_ping", "ip peer ping"),
            registry,
            provider,
        })
    }

    pub fn set_apiserver_healthy(&self, node_name: &str, latency_ms: f64) {
        self.apiserver.set_healthy(node_name, latency_ms);
    }

    pub fn set_apiserver_unhealthy(&self, node_name: &str) {
        self.apiserver.set_unhealthy(node_name);
    }

    pub fn set_internal_dns_healthy(&self, node_name: &str, latency_ms: f64) {
        self.internal_dns.set_healthy(node_name, latency_ms);
    }

    pub fn set_internal_dns_unhealthy(&self, node_name: &str) {
        self.internal_dns.set_unhealthy(node_name);
    }

    pub fn set_external_dns_healthy(&self, node_name: &str, latency_ms: f64) {
        self.external_dns.set_healthy(node_name, latency_ms);
    }

    pub fn set_external_dns_unhealthy(&self, node_name: &str) {
        self.external_dns.set_unhealthy(node_name);
    }

    pub fn record_pod_ping(
        &self,
        target_node_name: &str,
        target_node_ip: &str,
        target_pod_ip: &str,
        sample: PingSample,
    ) {
        let attrs = self.with_source([
            KeyValue::new("target_node_name", target_node_name.to_string()),
            KeyValue::new("target_node_ip", target_node_ip.to_string()),
            KeyValue::new("target_pod_ip", target_pod_ip.to_string()),
        ]);
        self.pod_ping.record(&attrs, sample);
    }

    pub fn record_node_ping(&self, target_node_name: &str, target_node_ip: &str, sample: PingSample) {
        let attrs = self.with_source([
            KeyValue::new("target_node_name", target_node_name.to_string()),
            KeyValue::new("target_node_ip", target_node_ip.to_string()),
        ]);
        self.node_ping.record(&attrs, sample);
    }

    pub fn record_ip_ping(&self, target_ip: &str, sample: PingSample) {
        let attrs = self.with_source([KeyValue::new("target_ip", target_ip.to_string())]);
        self.ip_ping.record(&attrs, sample);
    }

    fn with_source<const N: usize>(&self, target: [KeyValue; N]) -> Vec<KeyValue> {
        self.source.iter().cloned().chain(target).collect()
    }

    /// Current state in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics are not valid UTF-8")
    }

    /// Flushes pending OTLP exports and shuts down the MeterProvider
    pub fn shutdown(&self) {
        info!("Shutting down OpenTelemetry metrics...");
        if let Err(e) = self.provider.shutdown() {
            warn!("Failed to shutdown MeterProvider: {}", e);
        } else {
            info!("OpenTelemetry metrics shutdown complete");
        }
    }
}

fn latency_view(name: &'static str, boundaries: &[f64]) -> Result<Box<dyn View>> {
    new_view(
        Instrument::new().name(name),
        Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
            boundaries: boundaries.to_vec(),
            record_min_max: true,
        }),
    )
    .with_context(|| format!("Failed to create histogram view for {}", name))
}

fn otlp_reader(endpoint: &str) -> Result<PeriodicReader> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(10))
        .build()
        .context("Failed to create OTLP metric exporter")?;

    Ok(
        PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(Duration::from_secs(METRIC_EXPORT_INTERVAL_SECS))
            .build(),
    )
}

/// Push endpoint from `OTEL_EXPORTER_OTLP_ENDPOINT`, with `http://` added
/// when no scheme is given. Unset or empty disables OTLP export.
pub fn get_otlp_endpoint() -> Option<String> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    if endpoint.is_empty() {
        return None;
    }

    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        Some(format!("http://{}", endpoint))
    } else {
        Some(endpoint)
    }
}
