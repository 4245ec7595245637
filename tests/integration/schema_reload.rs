//! Schema-change signaling against a live mysqld

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mysql::prelude::*;
use tablet_health::config::HealthConfig;
use tablet_health::health::{HealthStreamer, TabletAlias, TabletType, Target};
use tablet_health::pool::MysqlConnector;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{get_mysql_config, skip_if_not_enabled};

const TABLE: &str = "it_schema_reload";

async fn primary_streamer() -> Arc<HealthStreamer> {
    let config = get_mysql_config();
    let health = HealthConfig {
        signal_when_schema_change: true,
        schema_change_reload_interval_secs: 3600,
        ..Default::default()
    };
    let mut streamer = HealthStreamer::new(TabletAlias::new("zone1", 300), &health);
    streamer.init_db_config(
        Target::new("it", "0", TabletType::Primary),
        Arc::new(MysqlConnector::new(config.backend())),
    );
    let streamer = Arc::new(streamer);
    streamer.open().await;
    streamer
        .change_state(TabletType::Primary, SystemTime::now(), Duration::ZERO, None, true)
        .await;
    streamer
}

#[tokio::test]
async fn test_altered_table_is_signaled() {
    skip_if_not_enabled!();

    let config = get_mysql_config();
    let mut admin = config.admin_conn();
    admin
        .query_drop(format!("DROP TABLE IF EXISTS {}", TABLE))
        .expect("DROP TABLE should succeed");
    admin
        .query_drop(format!("CREATE TABLE {} (id BIGINT PRIMARY KEY)", TABLE))
        .expect("CREATE TABLE should succeed");

    let streamer = primary_streamer().await;
    // Bring the shadow copy up to date with whatever exists already
    streamer.reload().await.expect("initial reload should succeed");
    streamer.reload().await.expect("second reload should succeed");

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(20);
    let task_streamer = streamer.clone();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move { task_streamer.stream(&task_cancel, tx).await });
    rx.recv().await.expect("initial snapshot");

    admin
        .query_drop(format!("ALTER TABLE {} ADD COLUMN note VARCHAR(32)", TABLE))
        .expect("ALTER TABLE should succeed");
    streamer.reload().await.expect("reload should succeed");

    let announced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = rx.recv().await.expect("stream ended early");
            if !snapshot.realtime_stats.table_schema_changed.is_empty() {
                return snapshot;
            }
        }
    })
    .await
    .expect("schema change should be announced");
    assert!(announced
        .realtime_stats
        .table_schema_changed
        .iter()
        .any(|t| t == TABLE));
    assert!(streamer
        .current()
        .await
        .realtime_stats
        .table_schema_changed
        .is_empty());

    cancel.cancel();
    handle.await.unwrap().unwrap();
    streamer.close().await;
    let _ = admin.query_drop(format!("DROP TABLE IF EXISTS {}", TABLE));
}

#[tokio::test]
async fn test_replica_reload_is_noop() {
    skip_if_not_enabled!();

    let streamer = primary_streamer().await;
    streamer
        .change_state(TabletType::Replica, SystemTime::now(), Duration::ZERO, None, true)
        .await;
    streamer.reload().await.expect("reload on replica should succeed");
    streamer.close().await;
}
