//! Named nftables counters and their Prometheus exporter

use crate::error::GatewayError;
use crate::expr::TableFamily;
use crate::gateway::{FilterGateway, KernelObject};
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

pub const COUNTER_FLOWSPEC_HANDLED: &str = "flowspec_handled";
pub const COUNTER_FLOWSPEC_DROPPED: &str = "flowspec_dropped";
pub const COUNTER_FLOWSPEC_LIMIT_MATCHED: &str = "flowspec_limit_matched";

/// Every counter the daemon provisions and exports.
pub const FLOWSPEC_COUNTERS: [&str; 3] = [
    COUNTER_FLOWSPEC_HANDLED,
    COUNTER_FLOWSPEC_DROPPED,
    COUNTER_FLOWSPEC_LIMIT_MATCHED,
];

/// How often kernel counters are read.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Create the named counters in the table.
pub async fn provision_counters<G: FilterGateway + ?Sized>(
    gateway: &G,
    family: TableFamily,
    table: &str,
) -> Result<(), GatewayError> {
    gateway
        .add_counters(family, table, &FLOWSPEC_COUNTERS)
        .await?;
    info!(table = %table, counters = ?FLOWSPEC_COUNTERS, "Provisioned nftables counters");
    Ok(())
}

/// Periodically copies the flowspec counters into Prometheus gauges.
pub struct CounterPoller<G: ?Sized> {
    gateway: Arc<G>,
    metrics: MetricsCollector,
    family: TableFamily,
    table: String,
    interval: Duration,
}

impl<G: FilterGateway + ?Sized> CounterPoller<G> {
    pub fn new(
        gateway: Arc<G>,
        metrics: MetricsCollector,
        family: TableFamily,
        table: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            metrics,
            family,
            table: table.into(),
            interval: POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Read the table's objects once and export the flowspec counters.
    ///
    /// Returns how many counters were exported.
    pub async fn poll_once(&self) -> Result<usize, GatewayError> {
        let objects = self.gateway.list_objects(self.family, &self.table).await?;
        let mut exported = 0;

        for object in objects {
            match object {
                KernelObject::Counter(counter) => {
                    if !FLOWSPEC_COUNTERS.contains(&counter.name.as_str()) {
                        continue;
                    }
                    trace!(
                        name = %counter.name,
                        packets = counter.packets,
                        bytes = counter.bytes,
                        "Counter values"
                    );
                    self.metrics
                        .set_counter(&counter.name, counter.packets, counter.bytes);
                    exported += 1;
                }
                KernelObject::Other { .. } => {}
            }
        }

        Ok(exported)
    }

    /// Poll at the configured interval until cancelled.
    ///
    /// The first poll happens immediately. Read failures are logged and the
    /// poller keeps going.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        debug!(interval = ?self.interval, "Counter poller started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Counter poller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "Failed to read nftables counters");
                    }
                }
            }
        }
    }
}
