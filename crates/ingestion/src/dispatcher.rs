//! Queue dispatcher
//!
//! Long-polls the request queue and forwards messages into the bounded
//! worker channel. A full channel blocks the dispatcher, so no more than
//! `channel_capacity` messages wait in process at any time.

use paperintake_common::{metrics, MessageQueue, QueueMessage};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Dispatcher {
    queue: Arc<dyn MessageQueue>,
    sender: mpsc::Sender<QueueMessage>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn MessageQueue>, sender: mpsc::Sender<QueueMessage>) -> Self {
        Self { queue, sender }
    }

    /// Poll until cancelled or every worker has gone away.
    /// Returns the number of messages forwarded.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        let mut forwarded = 0u64;
        info!("Dispatcher started");

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.queue.receive() => received,
            };

            let messages = match batch {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(error = %e, "Queue poll failed, polling again");
                    continue;
                }
            };
            if messages.is_empty() {
                continue;
            }

            debug!(count = messages.len(), "Received messages");
            metrics::record_received(messages.len());

            for message in messages {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(forwarded, "Dispatcher stopped");
                        return forwarded;
                    }
                    sent = self.sender.send(message) => sent,
                };
                if sent.is_err() {
                    info!(forwarded, "Worker channel closed, dispatcher stopping");
                    return forwarded;
                }
                forwarded += 1;
            }
        }

        info!(forwarded, "Dispatcher stopped");
        forwarded
    }
}
