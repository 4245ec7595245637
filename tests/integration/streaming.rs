//! Health streaming through the public API, no database required

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tablet_health::config::HealthConfig;
use tablet_health::health::{
    DetailClass, HealthSink, HealthSnapshot, HealthStreamer, SinkError, StreamError, TabletAlias,
    TabletType,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Collects snapshots and ends the stream after `limit` of them
struct Collect {
    seen: Vec<HealthSnapshot>,
    limit: usize,
    done: Option<tokio::sync::oneshot::Sender<Vec<HealthSnapshot>>>,
}

impl HealthSink for Collect {
    async fn send(&mut self, snapshot: HealthSnapshot) -> Result<(), SinkError> {
        self.seen.push(snapshot);
        if self.seen.len() < self.limit {
            return Ok(());
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(std::mem::take(&mut self.seen));
        }
        Err(SinkError::EndOfStream)
    }
}

async fn open_streamer(buffer: usize) -> Arc<HealthStreamer> {
    let config = HealthConfig {
        degraded_threshold_secs: 30,
        unhealthy_threshold_secs: 60,
        stream_buffer_size: buffer,
        ..Default::default()
    };
    let streamer = Arc::new(HealthStreamer::new(TabletAlias::new("zone1", 200), &config));
    streamer.open().await;
    streamer
}

fn spawn_channel_stream(
    streamer: &Arc<HealthStreamer>,
    capacity: usize,
) -> (
    CancellationToken,
    mpsc::Receiver<HealthSnapshot>,
    JoinHandle<Result<(), StreamError>>,
) {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(capacity);
    let streamer = streamer.clone();
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move { streamer.stream(&task_cancel, tx).await });
    (cancel, rx, handle)
}

async fn set_lag(streamer: &HealthStreamer, secs: u64) {
    streamer
        .change_state(
            TabletType::Replica,
            SystemTime::now(),
            Duration::from_secs(secs),
            None,
            true,
        )
        .await;
}

#[tokio::test]
async fn test_many_subscribers_see_same_sequence() {
    let streamer = open_streamer(20).await;

    let mut streams = Vec::new();
    for _ in 0..3 {
        let (cancel, mut rx, handle) = spawn_channel_stream(&streamer, 20);
        rx.recv().await.expect("initial snapshot");
        streams.push((cancel, rx, handle));
    }
    assert_eq!(streamer.subscriber_count().await, 3);

    for lag in [3, 1, 4, 1, 5] {
        set_lag(&streamer, lag).await;
    }

    for (cancel, mut rx, handle) in streams {
        let mut lags = Vec::new();
        for _ in 0..5 {
            lags.push(rx.recv().await.unwrap().realtime_stats.replication_lag_seconds);
        }
        assert_eq!(lags, vec![3, 1, 4, 1, 5]);
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
    assert_eq!(streamer.subscriber_count().await, 0);
}

#[tokio::test]
async fn test_custom_sink_ends_stream() {
    let streamer = open_streamer(20).await;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let sink = Collect {
        seen: Vec::new(),
        limit: 3,
        done: Some(done_tx),
    };

    let task_streamer = streamer.clone();
    let handle = tokio::spawn(async move {
        task_streamer.stream(&CancellationToken::new(), sink).await
    });
    while streamer.subscriber_count().await == 0 {
        tokio::task::yield_now().await;
    }
    set_lag(&streamer, 1).await;
    set_lag(&streamer, 2).await;

    let seen = done_rx.await.unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].realtime_stats.replication_lag_seconds, 2);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_overflowed_client_can_reconnect() {
    let streamer = open_streamer(2).await;
    let (_cancel, mut rx, handle) = spawn_channel_stream(&streamer, 1);
    while streamer.subscriber_count().await == 0 {
        tokio::task::yield_now().await;
    }

    for lag in 1..=10 {
        set_lag(&streamer, lag).await;
    }
    while rx.recv().await.is_some() {}
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, StreamError::ResourceExhausted));
    assert_eq!(
        err.to_string(),
        "stream health buffer overflowed. client should reconnect for up-to-date status"
    );

    // A new stream starts from the latest state
    let (cancel, mut rx, handle) = spawn_channel_stream(&streamer, 20);
    let first = rx.recv().await.unwrap();
    assert_eq!(first.realtime_stats.replication_lag_seconds, 10);
    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_close_and_reopen() {
    let streamer = open_streamer(20).await;
    let (_cancel, mut rx, handle) = spawn_channel_stream(&streamer, 20);
    rx.recv().await.unwrap();

    streamer.close().await;
    let err = handle.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "tabletserver is shutdown");

    streamer.open().await;
    let (cancel, mut rx, handle) = spawn_channel_stream(&streamer, 20);
    assert!(rx.recv().await.is_some());
    cancel.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_threshold_change_moves_lag_class() {
    let streamer = open_streamer(20).await;
    set_lag(&streamer, 45).await;
    assert_eq!(
        streamer.append_details(Vec::new()).await[0].class,
        DetailClass::Unhappy
    );

    streamer.set_unhealthy_threshold(Duration::from_secs(44)).await;
    assert_eq!(
        streamer.append_details(Vec::new()).await[0].class,
        DetailClass::Unhealthy
    );
}
