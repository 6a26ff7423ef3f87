// Event pipeline: formatter, orchestrator and the shared cancellable sender

pub mod formatter;
pub mod stream;

pub use formatter::Formatter;
pub use stream::{Pipeline, StreamOptions};

use crate::models::AggregatedEvent;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Producer side of the shared event channel. Every send races the token,
/// so a full channel never wedges a producer past cancellation.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<AggregatedEvent>,
    cancel: CancellationToken,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<AggregatedEvent>, cancel: CancellationToken) -> Self {
        Self { tx, cancel }
    }

    /// Same channel, guarded by a different token.
    pub fn with_token(&self, cancel: CancellationToken) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns false when cancelled or when the consumer is gone.
    pub async fn send(&self, event: AggregatedEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(event) => res.is_ok(),
        }
    }
}
