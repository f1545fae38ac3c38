//! Worker pool
//!
//! Workers share one receiver behind an async mutex. Each iteration asks the
//! rate governor for admission before taking a message; a denied worker idles
//! and asks again. A fatal outcome cancels the shared token so the rest of
//! the service shuts down.

use crate::processor::{Outcome, Processor};
use paperintake_common::QueueMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Why a worker stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Cancelled,
    ChannelClosed,
    Fatal(String),
}

pub struct WorkerPool {
    processor: Arc<Processor>,
    receiver: Arc<Mutex<mpsc::Receiver<QueueMessage>>>,
    workers: usize,
    idle_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        processor: Arc<Processor>,
        receiver: mpsc::Receiver<QueueMessage>,
        workers: usize,
        idle_interval: Duration,
    ) -> Self {
        Self {
            processor,
            receiver: Arc::new(Mutex::new(receiver)),
            workers,
            idle_interval,
        }
    }

    /// Spawn workers `1..=N` onto a join set
    pub fn spawn(self, cancel: CancellationToken) -> JoinSet<WorkerExit> {
        let mut set = JoinSet::new();
        for worker_id in 1..=self.workers {
            let worker = Worker {
                id: worker_id,
                processor: self.processor.clone(),
                receiver: self.receiver.clone(),
                idle_interval: self.idle_interval,
            };
            let span = tracing::info_span!("worker", worker_id);
            set.spawn(worker.run(cancel.clone()).instrument(span));
        }
        info!(workers = self.workers, "Worker pool started");
        set
    }

    /// Run the pool to completion, returning the first fatal reason if any
    pub async fn run(self, cancel: CancellationToken) -> Option<String> {
        let mut set = self.spawn(cancel);
        join_workers(&mut set).await
    }
}

/// Wait for every worker, returning the first fatal reason if any
pub async fn join_workers(set: &mut JoinSet<WorkerExit>) -> Option<String> {
    let mut fatal = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(WorkerExit::Fatal(reason)) => {
                fatal.get_or_insert(reason);
            }
            Ok(exit) => debug!(?exit, "Worker exited"),
            Err(e) => error!(error = %e, "Worker task panicked"),
        }
    }
    fatal
}

struct Worker {
    id: usize,
    processor: Arc<Processor>,
    receiver: Arc<Mutex<mpsc::Receiver<QueueMessage>>>,
    idle_interval: Duration,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) -> WorkerExit {
        debug!("Worker started");
        let governor = self.processor.governor().clone();

        loop {
            if cancel.is_cancelled() {
                return WorkerExit::Cancelled;
            }

            if !governor.may_consume(self.id) {
                tokio::select! {
                    _ = cancel.cancelled() => return WorkerExit::Cancelled,
                    _ = tokio::time::sleep(self.idle_interval) => continue,
                }
            }

            let next = {
                let mut receiver = self.receiver.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return WorkerExit::Cancelled,
                    message = receiver.recv() => message,
                }
            };
            let Some(message) = next else {
                return WorkerExit::ChannelClosed;
            };

            if let Outcome::Fatal(reason) = self.processor.handle(self.id, message).await {
                error!(reason = %reason, "Fatal outcome, shutting down");
                cancel.cancel();
                return WorkerExit::Fatal(reason);
            }
        }
    }
}
