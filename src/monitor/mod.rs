//! Local state monitor
//!
//! Periodically probes the local mysqld and feeds the result into the
//! health streamer:
//! - Role detection (primary / replica)
//! - Replication lag and replication thread errors
//! - Query rate derived from the `Questions` counter

mod probe;

pub use probe::{probe, ProbeError, ProbeResult, QUESTIONS_QUERY, READ_ONLY_QUERY, SLAVE_STATUS_QUERY};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::Rng as _;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::health::{HealthStreamer, QpsRates, TabletType};
use crate::metrics::metrics;
use crate::pool::{Connector, DbConn};

/// Drives [`HealthStreamer::change_state`] from periodic probes
pub struct StateMonitor {
    streamer: Arc<HealthStreamer>,
    connector: Arc<dyn Connector>,
    qps: Arc<QpsRates>,
    probe_interval: Duration,
    probe_timeout: Duration,
    /// Cached connection, dropped after any failure
    conn: Option<Box<dyn DbConn>>,
    tablet_type: TabletType,
    /// When this tablet last became primary
    reparented_at: SystemTime,
    last_questions: Option<(u64, Instant)>,
}

impl StateMonitor {
    /// `tablet_type` is reported until the first probe succeeds
    pub fn new(
        config: &MonitorConfig,
        streamer: Arc<HealthStreamer>,
        connector: Arc<dyn Connector>,
        qps: Arc<QpsRates>,
        tablet_type: TabletType,
    ) -> Self {
        Self {
            streamer,
            connector,
            qps,
            probe_interval: Duration::from_millis(config.probe_interval_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            conn: None,
            tablet_type,
            reparented_at: SystemTime::now(),
            last_questions: None,
        }
    }

    /// Spawn the probe loop. It stops when `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Probe once right away so the snapshot leaves the uninitialized state
            self.tick().await;

            // Random stagger (0-100% of interval) before settling on the period
            let interval_ms = self.probe_interval.as_millis().max(1) as u64;
            let initial_delay = rand::thread_rng().gen_range(0..interval_ms);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(initial_delay)) => {}
            }

            let mut ticker = tokio::time::interval(self.probe_interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("State monitor cancelled");
                        break;
                    }
                    _ = ticker.tick() => self.tick().await,
                }
            }
        })
    }

    /// Run one probe and report the outcome
    pub async fn tick(&mut self) {
        let result = tokio::time::timeout(self.probe_timeout, self.probe_with_conn()).await;

        match result {
            Ok(Ok(observed)) => {
                metrics().record_probe("success");
                self.apply(observed).await;
            }
            Ok(Err(e)) => {
                self.conn = None;
                metrics().record_probe("failure");
                warn!(error = %e, "State probe failed");
                self.report_failure(&e).await;
            }
            Err(_) => {
                self.conn = None;
                metrics().record_probe("timeout");
                warn!("State probe timed out");
                self.report_failure(&ProbeError::Timeout).await;
            }
        }
    }

    /// Probe with the cached connection, reconnecting once if it failed
    async fn probe_with_conn(&mut self) -> Result<ProbeResult, ProbeError> {
        if let Some(conn) = self.conn.as_mut() {
            match probe(conn.as_mut()).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    debug!(error = %e, "Cached connection failed, reconnecting");
                    self.conn = None;
                }
            }
        }

        let mut conn = self.connector.connect().await?;
        let result = probe(conn.as_mut()).await?;
        self.conn = Some(conn);
        Ok(result)
    }

    async fn apply(&mut self, observed: ProbeResult) {
        if observed.tablet_type != self.tablet_type {
            info!(
                from = %self.tablet_type,
                to = %observed.tablet_type,
                "Tablet type changed"
            );
            if observed.tablet_type.is_primary() {
                self.reparented_at = SystemTime::now();
            }
            self.tablet_type = observed.tablet_type;
        }

        if let Some(questions) = observed.questions {
            let now = Instant::now();
            if let Some((prev, at)) = self.last_questions {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 && questions >= prev {
                    self.qps.set((questions - prev) as f64 / elapsed);
                }
            }
            self.last_questions = Some((questions, now));
        }

        let err = observed.replication_error.map(ReplicationError);
        self.streamer
            .change_state(
                self.tablet_type,
                self.reparented_at,
                observed.lag,
                err.as_ref().map(|e| e as &(dyn std::error::Error + Send + Sync)),
                true,
            )
            .await;
    }

    async fn report_failure(&mut self, err: &ProbeError) {
        self.streamer
            .change_state(self.tablet_type, self.reparented_at, Duration::ZERO, Some(err), false)
            .await;
    }

    pub fn tablet_type(&self) -> TabletType {
        self.tablet_type
    }
}

/// Replication thread problem reported by a replica
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct ReplicationError(String);

#[cfg(test)]
mod tests {
    use super::probe::tests::{questions, single, slave_status};
    use super::*;
    use crate::config::HealthConfig;
    use crate::health::{QpsProvider, TabletAlias};
    use crate::pool::fake::FakeConnector;

    fn monitor(connector: &FakeConnector) -> (StateMonitor, Arc<HealthStreamer>, Arc<QpsRates>) {
        let qps = Arc::new(QpsRates::new());
        let streamer = Arc::new(
            HealthStreamer::new(TabletAlias::new("zone1", 100), &HealthConfig::default())
                .with_qps_provider(qps.clone()),
        );
        let monitor = StateMonitor::new(
            &MonitorConfig::default(),
            streamer.clone(),
            Arc::new(connector.clone()),
            qps.clone(),
            TabletType::Replica,
        );
        (monitor, streamer, qps)
    }

    #[tokio::test]
    async fn test_tick_reports_primary() {
        let connector = FakeConnector::default();
        connector.set_result(READ_ONLY_QUERY, single("@@read_only", "0"));
        let (mut monitor, streamer, _) = monitor(&connector);

        monitor.tick().await;

        let snapshot = streamer.current().await;
        assert_eq!(snapshot.target.tablet_type, TabletType::Primary);
        assert!(snapshot.serving);
        assert!(snapshot.tablet_externally_reparented_timestamp > 0);
        assert!(snapshot.realtime_stats.health_error.is_empty());
        assert_eq!(monitor.tablet_type(), TabletType::Primary);
    }

    #[tokio::test]
    async fn test_tick_reports_replication_error() {
        let connector = FakeConnector::default();
        connector.set_result(READ_ONLY_QUERY, single("@@read_only", "1"));
        connector.set_result(SLAVE_STATUS_QUERY, slave_status("No", "Yes", Some("12"), ""));
        let (mut monitor, streamer, _) = monitor(&connector);

        monitor.tick().await;

        let snapshot = streamer.current().await;
        assert_eq!(snapshot.target.tablet_type, TabletType::Replica);
        assert_eq!(snapshot.realtime_stats.replication_lag_seconds, 12);
        assert_eq!(
            snapshot.realtime_stats.health_error,
            "replication is not running: io thread No, sql thread Yes"
        );
        assert_eq!(snapshot.tablet_externally_reparented_timestamp, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reports_not_serving() {
        let connector = FakeConnector::default();
        connector.fail_connect(true);
        let (mut monitor, streamer, _) = monitor(&connector);

        monitor.tick().await;

        let snapshot = streamer.current().await;
        assert!(!snapshot.serving);
        assert_eq!(snapshot.target.tablet_type, TabletType::Replica);
        assert!(snapshot.realtime_stats.health_error.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_connection_cached_between_ticks() {
        let connector = FakeConnector::default();
        connector.set_result(READ_ONLY_QUERY, single("@@read_only", "0"));
        let (mut monitor, _streamer, _) = monitor(&connector);

        monitor.tick().await;
        monitor.tick().await;
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qps_from_questions_delta() {
        let connector = FakeConnector::default();
        connector.set_result(READ_ONLY_QUERY, single("@@read_only", "0"));
        connector.set_result(QUESTIONS_QUERY, questions(1000));
        let (mut monitor, _streamer, qps) = monitor(&connector);

        monitor.tick().await;
        assert_eq!(qps.total_rate(), 0.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        connector.set_result(QUESTIONS_QUERY, questions(1500));
        monitor.tick().await;

        let rate = qps.total_rate();
        assert!((rate - 50.0).abs() < 1.0, "unexpected rate {}", rate);
    }
}
