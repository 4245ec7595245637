use thiserror::Error;

use crate::pool::{ConnectionError, PoolError};

/// Why a health stream ended with an error
#[derive(Debug, Error)]
pub enum StreamError {
    /// The streamer is closed, or was closed while streaming
    #[error("tabletserver is shutdown")]
    Unavailable,

    /// The client fell behind and its mailbox was closed
    #[error("stream health buffer overflowed. client should reconnect for up-to-date status")]
    ResourceExhausted,

    /// The caller's sink failed
    #[error("health sink failed: {0}")]
    Sink(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Failure reported by a [`HealthSink`](super::HealthSink)
#[derive(Debug, Error)]
pub enum SinkError {
    /// The receiving side finished normally; the stream ends without error
    #[error("end of stream")]
    EndOfStream,

    #[error(transparent)]
    Failed(Box<dyn std::error::Error + Send + Sync>),
}

/// Schema-change detection failures
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("schema-change pool: {0}")]
    Pool(#[from] PoolError),

    #[error("schema-change query: {0}")]
    Query(#[from] ConnectionError),

    /// `init_db_config` was never called
    #[error("no database configured for schema-change detection")]
    NotConfigured,

    #[error("health streamer is closed")]
    Closed,
}
