//! HTTP endpoint for Prometheus scraping

use crate::metrics::MetricsCollector;
use axum::{Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Default metrics listen address
pub const DEFAULT_METRICS_ADDRESS: &str = "127.0.0.1:9302";

#[derive(Clone)]
struct MetricsServerState {
    collector: MetricsCollector,
}

/// Build the router serving `/metrics` and `/health`.
pub fn router(collector: MetricsCollector) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(MetricsServerState { collector })
}

/// Serve metrics on `addr` until `cancel` fires.
pub async fn start_metrics_server(
    collector: MetricsCollector,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, collector, cancel).await
}

/// Serve metrics on an already bound listener until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    collector: MetricsCollector,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "Serving metrics");

    axum::serve(listener, router(collector))
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            info!("Shutting down metrics server");
        })
        .await
}

/// Handle /metrics endpoint - Prometheus text format
async fn metrics_handler(State(state): State<MetricsServerState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.collector.registry.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", encoder.format_type())],
            buffer,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let collector = MetricsCollector::new().unwrap();
        collector.set_routes(4);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, collector, cancel.clone()));

        let health = http_get(addr, "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.ends_with("ok"));

        let metrics = http_get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("flowspec_routes_total 4"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_default_address_parses() {
        let addr: SocketAddr = DEFAULT_METRICS_ADDRESS.parse().unwrap();
        assert_eq!(addr.port(), 9302);
    }
}
