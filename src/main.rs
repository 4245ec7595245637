use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use tablet_health::config::{self, Config};
use tablet_health::health::{HealthSnapshot, HealthStreamer, QpsRates, StreamError, Target};
use tablet_health::metrics::start_metrics_server;
use tablet_health::monitor::StateMonitor;
use tablet_health::pool::MysqlConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = load_or_default_config();

    let connector = Arc::new(MysqlConnector::new(config.backend.clone()));
    let qps = Arc::new(QpsRates::new());

    let mut streamer = HealthStreamer::new(config.tablet.alias.clone(), &config.health)
        .with_qps_provider(qps.clone());
    streamer.init_db_config(
        Target::new(
            config.tablet.keyspace.clone(),
            config.tablet.shard.clone(),
            config.tablet.tablet_type,
        ),
        connector.clone(),
    );
    let streamer = Arc::new(streamer);
    streamer.open().await;

    info!(
        alias = %config.tablet.alias,
        keyspace = %config.tablet.keyspace,
        shard = %config.tablet.shard,
        backend = %connector.addr(),
        "Tablet health agent started"
    );

    let shutdown = CancellationToken::new();

    let monitor = if config.monitor.enabled {
        let monitor = StateMonitor::new(
            &config.monitor,
            streamer.clone(),
            connector.clone(),
            qps,
            config.tablet.tablet_type,
        );
        Some(monitor.spawn(shutdown.clone()))
    } else {
        warn!("State monitor disabled, health stays uninitialized until a state change is applied");
        None
    };

    if config.metrics.enabled {
        let addr = config.metrics.listen_addr.clone();
        let streamer = streamer.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(&addr, streamer).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    // Log every snapshot the stream produces
    let log_stream = {
        let streamer = streamer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { log_health_stream(streamer, shutdown).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    streamer.close().await;
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    let _ = log_stream.await;

    info!("Tablet health agent stopped");
    Ok(())
}

/// Follow the health stream, reconnecting after overflow, until shutdown
async fn log_health_stream(streamer: Arc<HealthStreamer>, shutdown: CancellationToken) {
    loop {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<HealthSnapshot>(16);
        let printer = tokio::spawn(async move {
            while let Some(snapshot) = rx.recv().await {
                let stats = &snapshot.realtime_stats;
                if !stats.table_schema_changed.is_empty() {
                    info!(tables = ?stats.table_schema_changed, "Schema change signaled");
                }
                debug!(
                    tablet_type = %snapshot.target.tablet_type,
                    serving = snapshot.serving,
                    lag_secs = stats.replication_lag_seconds,
                    qps = stats.qps,
                    health_error = %stats.health_error,
                    "Health snapshot"
                );
            }
        });

        let result = streamer.stream(&shutdown, tx).await;
        let _ = printer.await;
        match result {
            Ok(()) => return,
            Err(StreamError::ResourceExhausted) => {
                warn!("Health log stream fell behind, reconnecting");
            }
            Err(e) => {
                debug!(error = %e, "Health log stream ended");
                return;
            }
        }
    }
}

fn load_or_default_config() -> Config {
    let config_paths = ["config/tablet-health.toml", "tablet-health.toml"];

    match config::load_first(config_paths) {
        Ok(Some((path, config))) => {
            info!(path = %path.display(), "Loaded configuration");
            config
        }
        Ok(None) => {
            info!("No config file found, using default configuration");
            Config::default()
        }
        Err(e) => {
            warn!(error = %e, "Failed to load config, using default configuration");
            Config::default()
        }
    }
}
