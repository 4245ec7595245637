//! Tablet health streaming
//!
//! This module provides:
//! - The tablet's authoritative health snapshot and its change history
//! - Streaming of snapshots to any number of clients with bounded buffers
//! - Schema-drift detection on the primary, announced through the stream
//! - Replication lag classification for the status page

mod collaborators;
mod details;
mod error;
mod history;
mod reload;
mod sink;
mod snapshot;
pub(crate) mod sql;
mod streamer;
mod subscribers;
mod timer;

pub use collaborators::{NoFilteredReplication, QpsProvider, QpsRates, ReplicationStatus};
pub use details::{classify_lag, DetailClass, Kv};
pub use error::{ReloadError, SinkError, StreamError};
pub use history::{History, HistoryRecord, HISTORY_CAPACITY};
pub use sink::HealthSink;
pub use snapshot::{
    HealthSnapshot, InvalidAlias, RealtimeStats, TabletAlias, TabletType, Target, ERR_UNINITIALIZED,
};
pub use streamer::HealthStreamer;
pub use subscribers::{BroadcastReason, SubscriberId, SubscriberRegistry};
pub use timer::JitterTimer;
