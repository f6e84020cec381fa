//! flowspecd
//!
//! Main entry point: reads configuration, prepares the nftables chain and
//! runs the reconciliation loop until a termination signal arrives.

use clap::Parser;
use flowspecd::{
    provision_counters, start_metrics_server, BirdSocket, Cli, CounterPoller, DaemonConfig,
    FilterGateway, FlowspecError, MetricsCollector, NftGateway, Reconciler, Result,
};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("flowspecd: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.debug);
    info!(version = env!("CARGO_PKG_VERSION"), "flowspecd: Starting");

    match run_daemon(config).await {
        Ok(()) => {
            info!("flowspecd: Daemon exiting normally");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "flowspecd: Daemon exiting with error");
            ExitCode::FAILURE
        }
    }
}

/// Initialize structured logging; RUST_LOG takes precedence over `--debug`.
fn init_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    setup_signal_handlers(cancel.clone())?;

    let chain = config.chain_id();
    let gateway = Arc::new(NftGateway::default());
    gateway.ensure_table(chain.family, &chain.table).await?;
    gateway.ensure_chain(&chain).await?;
    info!(chain = %chain, "flowspecd: nftables chain ready");

    let metrics = MetricsCollector::new()?;

    let server = {
        let metrics = metrics.clone();
        let cancel = cancel.clone();
        let addr = config.metrics_listen_address;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, addr, cancel).await {
                error!(error = %e, address = %addr, "flowspecd: Metrics server failed");
            }
        })
    };

    let poller = if config.enable_counter {
        provision_counters(gateway.as_ref(), chain.family, &chain.table).await?;
        let poller = CounterPoller::new(
            gateway.clone(),
            metrics.clone(),
            chain.family,
            chain.table.clone(),
        );
        Some(tokio::spawn(poller.run(cancel.clone())))
    } else {
        None
    };

    let mut reconciler = Reconciler::new(
        BirdSocket::new(config.bird_socket.clone()),
        gateway,
        metrics,
        chain,
    )
    .with_interval(config.interval)
    .with_counters(config.enable_counter);

    let result = reconciler.run(cancel.clone()).await;

    // Stop the background tasks whichever way the loop ended
    cancel.cancel();
    if let Some(poller) = poller {
        join_task("counter poller", poller).await;
    }
    join_task("metrics server", server).await;

    result.map_err(FlowspecError::from)
}

/// Wait for a background task, logging a panic or abort. Returns whether the
/// task finished cleanly.
async fn join_task(name: &str, handle: JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            error!(task = name, error = %e, "flowspecd: Background task failed");
            false
        }
    }
}

/// Cancel `cancel` on SIGINT, SIGTERM or SIGHUP.
fn setup_signal_handlers(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("flowspecd: Received SIGINT"),
            _ = sigterm.recv() => info!("flowspecd: Received SIGTERM"),
            _ = sighup.recv() => info!("flowspecd: Received SIGHUP"),
        }
        info!("flowspecd: Signaling shutdown");
        cancel.cancel();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_task_reports_panic() {
        let clean = tokio::spawn(async {});
        assert!(join_task("clean", clean).await);

        let panicked = tokio::spawn(async { panic!("poller blew up") });
        assert!(!join_task("panicked", panicked).await);

        let aborted = tokio::spawn(std::future::pending::<()>());
        aborted.abort();
        assert!(!join_task("aborted", aborted).await);
    }
}
