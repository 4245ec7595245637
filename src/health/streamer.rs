//! The health streamer
//!
//! Holds the tablet's single health snapshot and fans every change out to
//! streaming clients. One async mutex guards the snapshot, the client
//! registry, the history and the shutdown token; schema-change detection
//! holds it across its database round trips so no state change can
//! interleave with a reload.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::metrics::metrics;
use crate::pool::{ConnPool, ConnPoolConfig, Connector};

use super::collaborators::{NoFilteredReplication, QpsProvider, QpsRates, ReplicationStatus};
use super::details::{classify_lag, DetailClass, Kv};
use super::error::{SinkError, StreamError};
use super::history::{History, HistoryRecord, HISTORY_CAPACITY};
use super::sink::HealthSink;
use super::snapshot::{HealthSnapshot, TabletAlias, TabletType, Target};
use super::subscribers::{BroadcastReason, SubscriberId, SubscriberRegistry};
use super::timer::JitterTimer;

/// Everything guarded by the streamer's main lock
pub(super) struct StreamerState {
    /// Present while open; cancelled on close
    pub(super) shutdown: Option<CancellationToken>,
    pub(super) subscribers: SubscriberRegistry,
    pub(super) snapshot: HealthSnapshot,
    pub(super) history: History,
    /// Whether the shadow schema copy has been created
    pub(super) init_success: bool,
}

impl StreamerState {
    pub(super) fn broadcast(&mut self, reason: BroadcastReason) -> usize {
        let snapshot = self.snapshot.clone();
        self.subscribers.broadcast(&snapshot, reason)
    }
}

pub struct HealthStreamer {
    degraded_threshold: Duration,
    unhealthy_threshold: RwLock<Duration>,
    signal_when_schema_change: bool,
    replication: Arc<dyn ReplicationStatus>,
    qps: Arc<dyn QpsProvider>,
    pub(super) state: Mutex<StreamerState>,
    /// Clients whose stream was dropped while the main lock was busy
    orphaned: SyncMutex<Vec<SubscriberId>>,
    /// Schema-change machinery, present only when signaling is enabled
    pub(super) conns: Option<ConnPool>,
    timer: Option<JitterTimer>,
    connector: Option<Arc<dyn Connector>>,
}

impl HealthStreamer {
    pub fn new(alias: TabletAlias, config: &HealthConfig) -> Self {
        let (conns, timer) = if config.signal_when_schema_change {
            let pool = ConnPool::new(
                "schema-change",
                ConnPoolConfig {
                    capacity: 1,
                    idle_timeout: config.idle_timeout(),
                    query_timeout: config.query_timeout(),
                },
            );
            let timer = JitterTimer::new(config.reload_interval(), config.schema_change_reload_jitter);
            (Some(pool), Some(timer))
        } else {
            (None, None)
        };

        Self {
            degraded_threshold: config.degraded_threshold(),
            unhealthy_threshold: RwLock::new(config.unhealthy_threshold()),
            signal_when_schema_change: config.signal_when_schema_change,
            replication: Arc::new(NoFilteredReplication),
            qps: Arc::new(QpsRates::new()),
            state: Mutex::new(StreamerState {
                shutdown: None,
                subscribers: SubscriberRegistry::new(config.stream_buffer_size),
                snapshot: HealthSnapshot::uninitialized(alias),
                history: History::new(HISTORY_CAPACITY),
                init_success: false,
            }),
            orphaned: SyncMutex::new(Vec::new()),
            conns,
            timer,
            connector: None,
        }
    }

    pub fn with_replication_status(mut self, replication: Arc<dyn ReplicationStatus>) -> Self {
        self.replication = replication;
        self
    }

    pub fn with_qps_provider(mut self, qps: Arc<dyn QpsProvider>) -> Self {
        self.qps = qps;
        self
    }

    /// Set the served target and the database used for schema-change
    /// detection. Must be called before [`HealthStreamer::open`].
    pub fn init_db_config(&mut self, target: Target, connector: Arc<dyn Connector>) {
        self.state.get_mut().snapshot.target = target;
        self.connector = Some(connector);
    }

    /// Start serving streams. Opening an open streamer does nothing.
    pub async fn open(self: &Arc<Self>) {
        let mut state = self.lock_state().await;
        if state.shutdown.is_some() {
            return;
        }
        state.shutdown = Some(CancellationToken::new());

        if let (Some(conns), Some(timer)) = (&self.conns, &self.timer) {
            match &self.connector {
                Some(connector) => {
                    conns.open(connector.clone());
                    let streamer = Arc::downgrade(self);
                    timer.start(move || {
                        let streamer = streamer.clone();
                        async move {
                            let Some(streamer) = streamer.upgrade() else {
                                return;
                            };
                            if let Err(e) = streamer.reload().await {
                                error!(error = %e, "Periodic schema reload failed in health stream");
                            }
                        }
                    });
                }
                None => {
                    warn!("Schema-change signaling enabled but no database configured, not starting reloads");
                }
            }
        }
        info!(
            signal_when_schema_change = self.signal_when_schema_change,
            "Health streamer opened"
        );
    }

    /// Stop serving. Active streams end with [`StreamError::Unavailable`].
    pub async fn close(&self) {
        if let Some(timer) = &self.timer {
            timer.stop();
        }

        let mut state = self.lock_state().await;
        if let Some(shutdown) = state.shutdown.take() {
            shutdown.cancel();
            info!("Health streamer closed");
        }
        if let Some(conns) = &self.conns {
            conns.close();
        }
    }

    pub async fn is_open(&self) -> bool {
        self.lock_state().await.shutdown.is_some()
    }

    /// Stream health snapshots into `sink` until `cancel` fires, the
    /// streamer closes, the client falls behind or the sink gives up.
    ///
    /// The first snapshot delivered is the current one.
    pub async fn stream<S: HealthSink>(
        &self,
        cancel: &CancellationToken,
        mut sink: S,
    ) -> Result<(), StreamError> {
        let (id, mut rx, shutdown) = self.register().await.ok_or(StreamError::Unavailable)?;
        let guard = SubscriptionGuard {
            streamer: self,
            id,
            released: false,
        };

        if self.signal_when_schema_change {
            if let Some(timer) = &self.timer {
                timer.trigger();
            }
        }

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                _ = shutdown.cancelled() => break Err(StreamError::Unavailable),
                item = rx.recv() => {
                    let Some(snapshot) = item else {
                        break Err(StreamError::ResourceExhausted);
                    };
                    // A sink that stops accepting must not pin the stream open
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Ok(()),
                        _ = shutdown.cancelled() => break Err(StreamError::Unavailable),
                        sent = sink.send(snapshot) => match sent {
                            Ok(()) => {}
                            Err(SinkError::EndOfStream) => break Ok(()),
                            Err(SinkError::Failed(e)) => break Err(StreamError::Sink(e)),
                        },
                    }
                }
            }
        };

        guard.release().await;
        debug!(subscriber = id, result = ?result.as_ref().err(), "Health stream ended");
        result
    }

    pub(super) async fn register(&self) -> Option<(SubscriberId, mpsc::Receiver<HealthSnapshot>, CancellationToken)> {
        let mut state = self.lock_state().await;
        let shutdown = state.shutdown.clone()?;
        let current = state.snapshot.clone();
        let (id, rx) = state.subscribers.add(current);
        Some((id, rx, shutdown))
    }

    async fn unregister(&self, id: SubscriberId) {
        self.lock_state().await.subscribers.remove(id);
    }

    /// Take the main lock, first dropping clients whose streams went away
    /// while it was held elsewhere
    pub(super) async fn lock_state(&self) -> MutexGuard<'_, StreamerState> {
        let mut state = self.state.lock().await;
        let orphaned = std::mem::take(&mut *self.orphaned.lock());
        for id in orphaned {
            state.subscribers.remove(id);
        }
        state
    }

    /// Apply a new tablet state and broadcast it
    pub async fn change_state(
        &self,
        tablet_type: TabletType,
        reparented_at: SystemTime,
        lag: Duration,
        err: Option<&(dyn std::error::Error + Send + Sync)>,
        serving: bool,
    ) {
        let health_error = err.map(|e| e.to_string());
        let (filtered_lag, binlog_players) = self.replication.status();
        let qps = self.qps.total_rate();

        let mut state = self.lock_state().await;
        let snapshot = &mut state.snapshot;
        snapshot.target.tablet_type = tablet_type;
        snapshot.tablet_externally_reparented_timestamp = if tablet_type.is_primary() {
            reparented_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0)
        } else {
            0
        };
        snapshot.realtime_stats.health_error = health_error.clone().unwrap_or_default();
        snapshot.realtime_stats.replication_lag_seconds = u32::try_from(lag.as_secs()).unwrap_or(u32::MAX);
        snapshot.serving = serving;
        snapshot.realtime_stats.filtered_replication_lag_seconds = filtered_lag;
        snapshot.realtime_stats.binlog_players_count = binlog_players;
        snapshot.realtime_stats.qps = qps;

        state.broadcast(BroadcastReason::StateChange);
        state.history.add(HistoryRecord {
            time: SystemTime::now(),
            serving,
            tablet_type,
            lag,
            error: health_error,
        });
        metrics().record_state_change(
            tablet_type.as_str(),
            serving,
            state.snapshot.realtime_stats.replication_lag_seconds,
        );
        debug!(tablet_type = %tablet_type, serving, lag_secs = lag.as_secs(), "Health state changed");
    }

    /// Change the lag above which the tablet reports unhealthy, then
    /// re-broadcast the current snapshot
    pub async fn set_unhealthy_threshold(&self, threshold: Duration) {
        *self.unhealthy_threshold.write() = threshold;
        info!(threshold_secs = threshold.as_secs(), "Unhealthy threshold changed");

        let mut state = self.lock_state().await;
        state.broadcast(BroadcastReason::ThresholdChange);
    }

    pub fn unhealthy_threshold(&self) -> Duration {
        *self.unhealthy_threshold.read()
    }

    /// Append replication rows to a status-page detail list. Primaries have
    /// nothing to add.
    pub async fn append_details(&self, mut details: Vec<Kv>) -> Vec<Kv> {
        let state = self.lock_state().await;
        if state.snapshot.target.tablet_type.is_primary() {
            return details;
        }

        let stats = &state.snapshot.realtime_stats;
        let lag = Duration::from_secs(u64::from(stats.replication_lag_seconds));
        let class = classify_lag(lag, self.degraded_threshold, self.unhealthy_threshold());
        details.push(Kv::new(
            "Replication Lag",
            class,
            format!("{}s", stats.replication_lag_seconds),
        ));
        if !stats.health_error.is_empty() {
            details.push(Kv::new(
                "Replication Error",
                DetailClass::Unhappy,
                stats.health_error.clone(),
            ));
        }
        details
    }

    /// Recent state transitions, newest first
    pub async fn history(&self) -> Vec<HistoryRecord> {
        self.lock_state().await.history.records()
    }

    /// A copy of the current snapshot
    pub async fn current(&self) -> HealthSnapshot {
        self.lock_state().await.snapshot.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.lock_state().await.subscribers.len()
    }

    /// Plain-text status page: current state, detail rows and history
    pub async fn status_report(&self) -> String {
        let snapshot = self.current().await;
        let details = self.append_details(Vec::new()).await;
        let history = self.history().await;

        let mut out = String::new();
        let _ = writeln!(out, "tablet: {}", snapshot.tablet_alias);
        let _ = writeln!(
            out,
            "target: {}/{} ({})",
            snapshot.target.keyspace, snapshot.target.shard, snapshot.target.tablet_type
        );
        let _ = writeln!(out, "serving: {}", snapshot.serving);
        if !snapshot.realtime_stats.health_error.is_empty() {
            let _ = writeln!(out, "health error: {}", snapshot.realtime_stats.health_error);
        }
        let _ = writeln!(out, "qps: {:.2}", snapshot.realtime_stats.qps);

        if !details.is_empty() {
            let _ = writeln!(out, "\ndetails:");
            for kv in &details {
                let _ = writeln!(out, "  [{}] {}: {}", kv.class, kv.key, kv.value);
            }
        }

        let _ = writeln!(out, "\nhistory:");
        for record in &history {
            let secs = record
                .time
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(out, "  {} [{}] {}", secs, record.class(), record.status());
        }
        out
    }
}

/// Unregisters a stream client on every exit path
struct SubscriptionGuard<'a> {
    streamer: &'a HealthStreamer,
    id: SubscriberId,
    released: bool,
}

impl SubscriptionGuard<'_> {
    async fn release(mut self) {
        self.streamer.unregister(self.id).await;
        self.released = true;
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Dropped mid-stream. If the lock is busy, its next holder removes
        // the client.
        match self.streamer.state.try_lock() {
            Ok(mut state) => {
                state.subscribers.remove(self.id);
            }
            Err(_) => self.streamer.orphaned.lock().push(self.id),
        }
    }
}
