//! Prometheus metrics collection for flowspecd

use prometheus::{
    exponential_buckets, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounterVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector shared by the loop, the counter poller and the HTTP
/// exporter.
#[derive(Clone)]
pub struct MetricsCollector {
    // Gauges
    pub flowspec_routes_total: Gauge,
    pub nftables_counter_packets: GaugeVec,
    pub nftables_counter_bytes: GaugeVec,

    // Counters
    pub route_errors_total: IntCounterVec,

    // Histograms
    pub bird_socket_query_duration_seconds: Histogram,
    pub nftables_flush_duration_seconds: Histogram,

    // Registry for export
    pub registry: Arc<Registry>,
}

impl MetricsCollector {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let flowspec_routes_total = Gauge::with_opts(Opts::new(
            "flowspec_routes_total",
            "Number of flowspec routes compiled in the last check",
        ))?;
        registry.register(Box::new(flowspec_routes_total.clone()))?;

        let nftables_counter_packets = GaugeVec::new(
            Opts::new(
                "nftables_counter_packets",
                "Packets seen by a named nftables counter",
            ),
            &["name"],
        )?;
        registry.register(Box::new(nftables_counter_packets.clone()))?;

        let nftables_counter_bytes = GaugeVec::new(
            Opts::new(
                "nftables_counter_bytes",
                "Bytes seen by a named nftables counter",
            ),
            &["name"],
        )?;
        registry.register(Box::new(nftables_counter_bytes.clone()))?;

        let route_errors_total = IntCounterVec::new(
            Opts::new(
                "flowspec_route_errors_total",
                "Route blocks skipped, by the stage that rejected them",
            ),
            &["stage"],
        )?;
        registry.register(Box::new(route_errors_total.clone()))?;

        let bird_socket_query_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "bird_socket_query_duration_seconds",
                "Duration of BIRD control socket queries in seconds",
            )
            .buckets(exponential_buckets(0.0001, 1.5, 15)?),
        )?;
        registry.register(Box::new(bird_socket_query_duration_seconds.clone()))?;

        let nftables_flush_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "nftables_flush_duration_seconds",
            "Duration of nftables rule set commits in seconds",
        ))?;
        registry.register(Box::new(nftables_flush_duration_seconds.clone()))?;

        Ok(Self {
            flowspec_routes_total,
            nftables_counter_packets,
            nftables_counter_bytes,
            route_errors_total,
            bird_socket_query_duration_seconds,
            nftables_flush_duration_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Update the number of routes compiled in the last check
    pub fn set_routes(&self, count: usize) {
        self.flowspec_routes_total.set(count as f64);
    }

    /// Record a route block rejected while parsing
    pub fn record_parse_error(&self) {
        self.route_errors_total.with_label_values(&["parse"]).inc();
    }

    /// Record a route rejected while compiling
    pub fn record_compile_error(&self) {
        self.route_errors_total.with_label_values(&["compile"]).inc();
    }

    pub fn observe_bird_query(&self, duration_secs: f64) {
        self.bird_socket_query_duration_seconds
            .observe(duration_secs);
    }

    pub fn observe_flush(&self, duration_secs: f64) {
        self.nftables_flush_duration_seconds.observe(duration_secs);
    }

    /// Export the current values of a named kernel counter
    pub fn set_counter(&self, name: &str, packets: u64, bytes: u64) {
        self.nftables_counter_packets
            .with_label_values(&[name])
            .set(packets as f64);
        self.nftables_counter_bytes
            .with_label_values(&[name])
            .set(bytes as f64);
    }
}
