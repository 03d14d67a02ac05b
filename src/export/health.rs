use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "gridscope" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total telemetry events received over the socket.
    pub events_received: Counter,
    /// Total events dropped due to decode or classification errors.
    pub events_dropped: Counter,
    /// Total buffer flushes that produced a publish.
    pub batches_flushed: Counter,
    /// Total table rows published across all flushes.
    pub rows_published: Counter,
    /// Total chart points published across all flushes.
    pub chart_points_published: Counter,
    /// Decode errors by kind.
    pub decode_errors: CounterVec,
    /// Whether the socket is connected (1=yes, 0=no).
    pub socket_connected: Gauge,
    /// Last measured ping round-trip in milliseconds.
    pub ping_ms: Gauge,
    /// Inbound messages per second over the last status tick.
    pub throughput: Gauge,
    /// Current buffering window length in events.
    pub buffer_len: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total telemetry events received over the socket.",
            )
            .namespace("gridscope"),
        )?;
        let events_dropped = Counter::with_opts(
            Opts::new(
                "events_dropped_total",
                "Total events dropped due to decode or classification errors.",
            )
            .namespace("gridscope"),
        )?;
        let batches_flushed = Counter::with_opts(
            Opts::new(
                "batches_flushed_total",
                "Total buffer flushes that produced a publish.",
            )
            .namespace("gridscope"),
        )?;
        let rows_published = Counter::with_opts(
            Opts::new(
                "rows_published_total",
                "Total table rows published across all flushes.",
            )
            .namespace("gridscope"),
        )?;
        let chart_points_published = Counter::with_opts(
            Opts::new(
                "chart_points_published_total",
                "Total chart points published across all flushes.",
            )
            .namespace("gridscope"),
        )?;
        let decode_errors = CounterVec::new(
            Opts::new("decode_errors_total", "Total decode errors by kind.")
                .namespace("gridscope"),
            &["kind"],
        )?;
        let socket_connected = Gauge::with_opts(
            Opts::new(
                "socket_connected",
                "Whether the socket is connected (1=yes, 0=no).",
            )
            .namespace("gridscope"),
        )?;
        let ping_ms = Gauge::with_opts(
            Opts::new("ping_ms", "Last measured ping round-trip in milliseconds.")
                .namespace("gridscope"),
        )?;
        let throughput = Gauge::with_opts(
            Opts::new(
                "throughput_msgs_per_sec",
                "Inbound messages per second over the last status tick.",
            )
            .namespace("gridscope"),
        )?;
        let buffer_len = Gauge::with_opts(
            Opts::new("buffer_len", "Current buffering window length in events.")
                .namespace("gridscope"),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(batches_flushed.clone()))?;
        registry.register(Box::new(rows_published.clone()))?;
        registry.register(Box::new(chart_points_published.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(socket_connected.clone()))?;
        registry.register(Box::new(ping_ms.clone()))?;
        registry.register(Box::new(throughput.clone()))?;
        registry.register(Box::new(buffer_len.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            batches_flushed,
            rows_published,
            chart_points_published,
            decode_errors,
            socket_connected,
            ping_ms,
            throughput,
            buffer_len,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
