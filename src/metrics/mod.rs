//! Prometheus metrics for the tablet health agent
//!
//! Exposes metrics and the health status page via an HTTP endpoint.

use std::sync::{Arc, OnceLock};

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

use crate::health::HealthStreamer;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Tablet health metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    // Streaming metrics
    /// Current registered stream clients
    pub subscribers: IntGauge,
    /// Broadcasts by reason
    pub broadcasts_total: IntCounterVec,
    /// Clients evicted for a full buffer, by broadcast reason
    pub evictions_total: IntCounterVec,

    // State metrics
    /// State changes applied, by tablet type
    pub state_changes_total: IntCounterVec,
    /// Latest reported replication lag
    pub replication_lag_seconds: IntGauge,
    /// 1 while serving, by tablet type
    pub serving: IntGaugeVec,

    // Schema-change metrics
    /// Schema reloads by result
    pub schema_reloads_total: IntCounterVec,
    /// Tables announced as changed
    pub schema_tables_changed_total: IntCounter,

    // Monitor metrics
    /// Local state probes by result
    pub probes_total: IntCounterVec,
}

impl Metrics {
    /// Create a new metrics collection
    pub fn new() -> Self {
        let registry = Registry::new();

        let subscribers = IntGauge::new(
            "tablet_health_subscribers",
            "Current number of health stream clients",
        )
        .unwrap();

        let broadcasts_total = IntCounterVec::new(
            Opts::new(
                "tablet_health_broadcasts_total",
                "Total number of health snapshot broadcasts",
            ),
            &["reason"], // state_change, schema_change, threshold_change
        )
        .unwrap();

        let evictions_total = IntCounterVec::new(
            Opts::new(
                "tablet_health_evictions_total",
                "Total number of stream clients closed because their buffer was full",
            ),
            &["reason"],
        )
        .unwrap();

        let state_changes_total = IntCounterVec::new(
            Opts::new(
                "tablet_health_state_changes_total",
                "Total number of tablet state changes",
            ),
            &["tablet_type"],
        )
        .unwrap();

        let replication_lag_seconds = IntGauge::new(
            "tablet_health_replication_lag_seconds",
            "Replication lag reported by the last state change",
        )
        .unwrap();

        let serving = IntGaugeVec::new(
            Opts::new(
                "tablet_health_serving",
                "Whether the tablet is serving (1) or not (0)",
            ),
            &["tablet_type"],
        )
        .unwrap();

        let schema_reloads_total = IntCounterVec::new(
            Opts::new(
                "tablet_health_schema_reloads_total",
                "Total number of schema-change checks by result",
            ),
            &["result"], // skipped, unchanged, changed, error
        )
        .unwrap();

        let schema_tables_changed_total = IntCounter::new(
            "tablet_health_schema_tables_changed_total",
            "Total number of tables announced as changed",
        )
        .unwrap();

        let probes_total = IntCounterVec::new(
            Opts::new(
                "tablet_health_probes_total",
                "Total number of local state probes by result",
            ),
            &["result"], // success, failure, timeout
        )
        .unwrap();

        registry.register(Box::new(subscribers.clone())).unwrap();
        registry
            .register(Box::new(broadcasts_total.clone()))
            .unwrap();
        registry
            .register(Box::new(evictions_total.clone()))
            .unwrap();
        registry
            .register(Box::new(state_changes_total.clone()))
            .unwrap();
        registry
            .register(Box::new(replication_lag_seconds.clone()))
            .unwrap();
        registry.register(Box::new(serving.clone())).unwrap();
        registry
            .register(Box::new(schema_reloads_total.clone()))
            .unwrap();
        registry
            .register(Box::new(schema_tables_changed_total.clone()))
            .unwrap();
        registry.register(Box::new(probes_total.clone())).unwrap();

        Self {
            registry,
            subscribers,
            broadcasts_total,
            evictions_total,
            state_changes_total,
            replication_lag_seconds,
            serving,
            schema_reloads_total,
            schema_tables_changed_total,
            probes_total,
        }
    }

    pub fn set_subscribers(&self, count: usize) {
        self.subscribers.set(count as i64);
    }

    /// Record one broadcast
    pub fn record_broadcast(&self, reason: &str) {
        self.broadcasts_total.with_label_values(&[reason]).inc();
    }

    /// Record clients evicted during a broadcast
    pub fn record_evictions(&self, reason: &str, count: usize) {
        self.evictions_total
            .with_label_values(&[reason])
            .inc_by(count as u64);
    }

    /// Record an applied state change
    pub fn record_state_change(&self, tablet_type: &str, serving: bool, lag_secs: u32) {
        self.state_changes_total
            .with_label_values(&[tablet_type])
            .inc();
        self.replication_lag_seconds.set(i64::from(lag_secs));
        self.serving.reset();
        self.serving
            .with_label_values(&[tablet_type])
            .set(i64::from(serving));
    }

    /// Record a schema-change check result
    pub fn record_schema_reload(&self, result: &str) {
        self.schema_reloads_total
            .with_label_values(&[result])
            .inc();
    }

    pub fn record_tables_changed(&self, count: usize) {
        self.schema_tables_changed_total.inc_by(count as u64);
    }

    /// Record a local state probe result
    pub fn record_probe(&self, result: &str) {
        self.probes_total.with_label_values(&[result]).inc();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the metrics HTTP server
///
/// Serves `/metrics`, `/health` and the `/debug/health` status page.
pub async fn start_metrics_server(addr: &str, streamer: Arc<HealthStreamer>) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
        streamer: Arc<HealthStreamer>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (status, content_type, body) = match req.uri().path() {
            "/metrics" => (
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                metrics().gather(),
            ),
            "/health" => {
                if streamer.is_open().await {
                    (StatusCode::OK, "text/plain", "OK".to_string())
                } else {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "text/plain",
                        "tabletserver is shutdown".to_string(),
                    )
                }
            }
            "/debug/health" => (
                StatusCode::OK,
                "text/plain; charset=utf-8",
                streamer.status_report().await,
            ),
            _ => (StatusCode::NOT_FOUND, "text/plain", "Not Found".to_string()),
        };

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
        }
        Ok(response)
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let streamer = streamer.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, streamer.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
