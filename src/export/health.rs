use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Prometheus metrics describing the logger's own operation.
///
/// All metrics use the "healthlog" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Completed cycles.
    pub cycles: Counter,
    /// Cycles that ended early with an error.
    pub cycle_failures: Counter,
    /// Wall-clock duration of whole cycles.
    pub cycle_duration: Histogram,
    /// Novel event lines appended across all streams.
    pub event_lines_appended: Counter,
    /// Metrics rows appended.
    pub metrics_rows: Counter,
    /// Integrity probe write/verify iterations.
    pub integrity_iterations: Counter,
    /// Integrity probe pairs quarantined.
    pub integrity_mismatches: Counter,
    /// Scratch tier evictions, by tier.
    pub evictions: CounterVec,
    /// Free space seen by the capacity guard, in bytes.
    pub free_space_bytes: Gauge,
    /// Last write speed measurement in seconds, by kind (big/small).
    pub write_speed_seconds: GaugeVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let cycles = Counter::with_opts(
            Opts::new("cycles_total", "Completed logging cycles.").namespace("healthlog"),
        )?;
        let cycle_failures = Counter::with_opts(
            Opts::new(
                "cycle_failures_total",
                "Logging cycles that ended early with an error.",
            )
            .namespace("healthlog"),
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new("cycle_duration_seconds", "Duration of a whole cycle.")
                .namespace("healthlog")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 90.0, 120.0, 300.0, 600.0]),
        )?;
        let event_lines_appended = Counter::with_opts(
            Opts::new(
                "event_lines_appended_total",
                "Novel event lines appended across all streams.",
            )
            .namespace("healthlog"),
        )?;
        let metrics_rows = Counter::with_opts(
            Opts::new("metrics_rows_total", "Metrics rows appended.").namespace("healthlog"),
        )?;
        let integrity_iterations = Counter::with_opts(
            Opts::new(
                "integrity_iterations_total",
                "Write integrity probe iterations.",
            )
            .namespace("healthlog"),
        )?;
        let integrity_mismatches = Counter::with_opts(
            Opts::new(
                "integrity_mismatches_total",
                "Write integrity probe pairs quarantined after a readback mismatch.",
            )
            .namespace("healthlog"),
        )?;
        let evictions = CounterVec::new(
            Opts::new("evictions_total", "Scratch tier evictions by tier.").namespace("healthlog"),
            &["tier"],
        )?;
        let free_space_bytes = Gauge::with_opts(
            Opts::new(
                "free_space_bytes",
                "Free space seen by the capacity guard.",
            )
            .namespace("healthlog"),
        )?;
        let write_speed_seconds = GaugeVec::new(
            Opts::new(
                "write_speed_seconds",
                "Last write speed measurement by kind.",
            )
            .namespace("healthlog"),
            &["kind"],
        )?;

        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_failures.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(event_lines_appended.clone()))?;
        registry.register(Box::new(metrics_rows.clone()))?;
        registry.register(Box::new(integrity_iterations.clone()))?;
        registry.register(Box::new(integrity_mismatches.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(free_space_bytes.clone()))?;
        registry.register(Box::new(write_speed_seconds.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_failures,
            cycle_duration,
            event_lines_appended,
            metrics_rows,
            integrity_iterations,
            integrity_mismatches,
            evictions,
            free_space_bytes,
            write_speed_seconds,
        })
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Serve `/metrics` and `/healthz` in the background until [`stop`].
    /// Returns the bound address.
    ///
    /// [`stop`]: HealthMetrics::stop
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind = bind_address(&self.addr);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("binding health server to {bind}"))?;
        let local = listener.local_addr().context("reading health server address")?;

        let routes = Router::new()
            .route("/metrics", get(serve_metrics))
            .route("/healthz", get(|| async { "ok" }))
            .with_state(self.registry.clone());

        let stop = CancellationToken::new();
        if let Some(previous) = self.shutdown.lock().replace(stop.clone()) {
            previous.cancel();
        }

        tokio::spawn(async move {
            info!(addr = %local, "health server listening");
            let served = axum::serve(listener, routes)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "health server failed");
            }
        });

        Ok(local)
    }

    /// Ask the server to finish in-flight requests and exit.
    pub fn stop(&self) {
        if let Some(stop) = self.shutdown.lock().take() {
            stop.cancel();
        }
    }
}

/// Expand the `:port` shorthand to all interfaces; empty means ":9090".
pub fn bind_address(addr: &str) -> String {
    match addr {
        "" => "0.0.0.0:9090".to_string(),
        port if port.starts_with(':') => format!("0.0.0.0{port}"),
        full => full.to_string(),
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("metrics are not UTF-8")
}

async fn serve_metrics(State(registry): State<Registry>) -> (StatusCode, String) {
    match encode(&registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            error!(error = format!("{e:#}"), "serving /metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    async fn get_body(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("send");

        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        assert!(response.starts_with("HTTP/1.1 200"), "got {response:?}");
        response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .expect("body")
    }

    #[test]
    fn test_render_includes_namespaced_metrics() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.cycles.inc();
        health.evictions.with_label_values(&["normal"]).inc();
        health
            .write_speed_seconds
            .with_label_values(&["big"])
            .set(1.25);

        let text = health.render().expect("render");
        assert!(text.contains("healthlog_cycles_total 1"));
        assert!(text.contains("healthlog_evictions_total{tier=\"normal\"} 1"));
        assert!(text.contains("healthlog_write_speed_seconds{kind=\"big\"} 1.25"));
    }

    #[test]
    fn test_bind_address() {
        assert_eq!(bind_address(""), "0.0.0.0:9090");
        assert_eq!(bind_address(":9464"), "0.0.0.0:9464");
        assert_eq!(bind_address("127.0.0.1:0"), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_served_metrics_match_render() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.cycles.inc_by(3.0);
        health.free_space_bytes.set(4096.0);

        let addr = health.start().await.expect("start");
        assert_eq!(get_body(addr, "/metrics").await, health.render().expect("render"));
        assert_eq!(get_body(addr, "/healthz").await, "ok");

        health.stop();
    }
}
