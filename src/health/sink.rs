use std::future::Future;

use tokio::sync::mpsc;

use super::error::SinkError;
use super::snapshot::HealthSnapshot;

/// Destination of a health stream
///
/// The stream awaits each `send` before taking the next snapshot, so a
/// slow sink eventually overflows its mailbox and ends the stream.
pub trait HealthSink: Send {
    fn send(&mut self, snapshot: HealthSnapshot) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Forward into a channel. A dropped receiver ends the stream cleanly.
impl HealthSink for mpsc::Sender<HealthSnapshot> {
    async fn send(&mut self, snapshot: HealthSnapshot) -> Result<(), SinkError> {
        mpsc::Sender::send(self, snapshot)
            .await
            .map_err(|_| SinkError::EndOfStream)
    }
}
