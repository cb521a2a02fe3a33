use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Readiness flag, cleared when shutdown starts.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flip readiness.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Serve `/metrics`, `/health` and `/ready` on `addr` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if installing the recorder or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("debug server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Liveness: 200 while the process runs.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness: 503 once the server is draining.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Session and attendant gauges.
pub mod gauges {
    /// Increment the active sessions gauge.
    pub fn inc_sessions_active() {
        metrics::gauge!("rooms_sessions_active").increment(1.0);
    }

    /// Decrement the active sessions gauge.
    pub fn dec_sessions_active() {
        metrics::gauge!("rooms_sessions_active").decrement(1.0);
    }

    /// Set the number of announced peers.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_attendants(count: usize) {
        metrics::gauge!("rooms_attendants").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a handshake outcome with the given status label.
    pub fn handshakes_total(status: &'static str) {
        metrics::counter!("rooms_handshakes_total", "status" => status).increment(1);
    }

    /// Count an inbound call by shape.
    pub fn calls_total(shape: &'static str) {
        metrics::counter!("rooms_calls_total", "shape" => shape).increment(1);
    }

    /// Count an established tunnel.
    pub fn tunnels_total() {
        metrics::counter!("rooms_tunnels_total").increment(1);
    }

    /// Record bytes spliced through tunnels.
    pub fn tunnel_bytes_total(bytes: u64) {
        metrics::counter!("rooms_tunnel_bytes_total").increment(bytes);
    }
}

/// Duration histograms.
pub mod histograms {
    /// Record how long a session lasted, in seconds.
    pub fn session_duration_seconds(value: f64) {
        metrics::histogram!("rooms_session_duration_seconds").record(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_reflects_drain_state() {
        let state = HealthState::new();
        let (code, _) = ready_handler(state.clone()).await;
        assert_eq!(code, StatusCode::OK);
        state.set_ready(false);
        let (code, body) = ready_handler(state).await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        gauges::set_attendants(3);
        counters::calls_total("async");
        histograms::session_duration_seconds(0.5);
    }
}
