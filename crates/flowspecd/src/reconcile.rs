//! Reconciliation loop
//!
//! Each tick fetches the flowspec routes from BIRD, compiles them, and
//! replaces the contents of the owned chain when the compiled rule set
//! differs from what was last applied. The checksum of the last successful
//! apply is the only state carried from one tick to the next.

use crate::bird::{ROUTE_QUERY, RouteSource};
use crate::checksum::{Checksum, digest};
use crate::compiler::compile;
use crate::config::DEFAULT_INTERVAL;
use crate::error::{ApplyError, FetchError};
use crate::expr::{ChainId, CompiledRuleSet};
use crate::gateway::{Batch, FilterGateway};
use crate::metrics::MetricsCollector;
use crate::parser::{parse_route, split_blocks};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Routes could not be fetched; kernel state untouched
    FetchFailed,
    /// Shutdown was requested before anything was applied
    Cancelled,
    /// Compiled rule set matches the last apply
    Unchanged(Checksum),
    /// Chain contents were replaced
    Applied { checksum: Checksum, rules: usize },
}

/// Drives route fetches and chain replacement.
pub struct Reconciler<S, G: ?Sized> {
    source: S,
    gateway: Arc<G>,
    metrics: MetricsCollector,
    chain: ChainId,
    interval: Duration,
    enable_counter: bool,
    last_applied: Checksum,
}

impl<S, G> Reconciler<S, G>
where
    S: RouteSource,
    G: FilterGateway + ?Sized,
{
    pub fn new(source: S, gateway: Arc<G>, metrics: MetricsCollector, chain: ChainId) -> Self {
        Self {
            source,
            gateway,
            metrics,
            chain,
            interval: DEFAULT_INTERVAL,
            enable_counter: false,
            last_applied: Checksum::ZERO,
        }
    }

    /// Tick period, also the bound on each route fetch.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Reference the named counters from compiled rules.
    pub fn with_counters(mut self, enable_counter: bool) -> Self {
        self.enable_counter = enable_counter;
        self
    }

    pub fn last_applied(&self) -> Checksum {
        self.last_applied
    }

    /// Run ticks at the configured interval until cancelled.
    ///
    /// The first tick runs immediately. Returns an error only when a commit
    /// fails, after which the kernel state is unknown.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ApplyError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            chain = %self.chain,
            interval = ?self.interval,
            counters = self.enable_counter,
            "Starting reconciliation loop"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if self.tick(&cancel).await? == TickOutcome::Cancelled {
                        break;
                    }
                }
            }
        }

        info!("Reconciliation loop stopped");
        Ok(())
    }

    /// Run one reconciliation pass.
    pub async fn tick(&mut self, cancel: &CancellationToken) -> Result<TickOutcome, ApplyError> {
        let text = match self.fetch(cancel).await {
            Ok(text) => text,
            Err(FetchError::Cancelled) => {
                debug!("Route query cancelled");
                return Ok(TickOutcome::Cancelled);
            }
            Err(e) => {
                error!(error = %e, "Failed to query BIRD");
                return Ok(TickOutcome::FetchFailed);
            }
        };

        let rule_set = self.compile_routes(&text);
        self.check_installed(&rule_set).await;

        let checksum = digest(&rule_set);
        if checksum == self.last_applied {
            debug!(checksum = %checksum, "Checksums match, skipping nftables update");
            return Ok(TickOutcome::Unchanged(checksum));
        }

        if cancel.is_cancelled() {
            return Ok(TickOutcome::Cancelled);
        }

        let rules = rule_set.len();
        self.apply(rule_set, checksum).await?;
        Ok(TickOutcome::Applied { checksum, rules })
    }

    /// Fetch the route dump, bounded by the interval and by `cancel`.
    async fn fetch(&self, cancel: &CancellationToken) -> Result<String, FetchError> {
        let start = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            fetched = tokio::time::timeout(self.interval, self.source.fetch(ROUTE_QUERY)) => {
                fetched.unwrap_or(Err(FetchError::Timeout(self.interval)))
            }
        };
        self.metrics
            .observe_bird_query(start.elapsed().as_secs_f64());
        result
    }

    /// Parse and compile every route block, skipping the ones that fail.
    fn compile_routes(&self, text: &str) -> CompiledRuleSet {
        let mut rule_set = CompiledRuleSet::new(self.chain.clone());

        for block in split_blocks(text) {
            let route = match parse_route(block) {
                Ok(route) => route,
                Err(e) => {
                    warn!(error = %e, block = %block.trim(), "Failed to parse flowspec route");
                    self.metrics.record_parse_error();
                    continue;
                }
            };

            match compile(&route, self.enable_counter) {
                Ok(rule) => rule_set.push(rule),
                Err(e) => {
                    warn!(
                        error = %e,
                        session = %route.session.session_name,
                        "Failed to compile flowspec route"
                    );
                    self.metrics.record_compile_error();
                }
            }
        }

        rule_set
    }

    /// Force the next apply when the kernel does not hold as many rules as
    /// were compiled.
    async fn check_installed(&mut self, rule_set: &CompiledRuleSet) {
        match self.gateway.list_rules(&self.chain).await {
            Ok(installed) if installed.len() == rule_set.len() => {}
            Ok(installed) => {
                info!(
                    installed = installed.len(),
                    compiled = rule_set.len(),
                    "Rule count in nftables chain does not match, reapplying all rules"
                );
                self.last_applied = Checksum::ZERO;
            }
            Err(e) => {
                error!(error = %e, chain = %self.chain, "Failed to list installed rules");
                self.last_applied = Checksum::ZERO;
            }
        }
    }

    /// Atomically replace the chain contents.
    async fn apply(&mut self, rule_set: CompiledRuleSet, checksum: Checksum) -> Result<(), ApplyError> {
        let rules = rule_set.len();
        info!(checksum = %checksum, rules, "Updating nftables");
        self.metrics.set_routes(rules);

        let batch = Batch::replace_chain(&rule_set.chain, &rule_set.rules);
        let start = Instant::now();
        self.gateway
            .commit(batch)
            .await
            .map_err(|source| ApplyError::Commit {
                table: self.chain.table.clone(),
                chain: self.chain.chain.clone(),
                rules,
                source,
            })?;

        let elapsed = start.elapsed();
        self.metrics.observe_flush(elapsed.as_secs_f64());
        self.last_applied = checksum;
        info!(duration = ?elapsed, "nftables updated");
        Ok(())
    }
}
