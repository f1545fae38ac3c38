//! Service supervisor
//!
//! Wires the dispatcher, health gate and worker pool around one
//! cancellation token:
//! - the dispatcher starts immediately and fills the bounded channel
//! - the worker pool starts when the health gate first sees extraction up
//! - a fatal worker outcome or a shutdown signal cancels everything

use crate::dispatcher::Dispatcher;
use crate::health::{HealthGate, HealthSettings, HealthStatus};
use crate::pool::WorkerPool;
use crate::processor::{Collaborators, Processor, ProcessorSettings};
use crate::rate_governor::{GovernorSettings, RateGovernor};
use paperintake_common::config::AppConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Extraction service unreachable: {reason}")]
    ExtractionUnreachable { reason: String },
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub workers: usize,
    pub idle_interval: Duration,
    pub channel_capacity: usize,
    pub governor: GovernorSettings,
    pub health: HealthSettings,
    pub processor: ProcessorSettings,
}

impl ServiceSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.workers.count,
            idle_interval: config.idle_interval(),
            channel_capacity: config.queue.channel_capacity,
            governor: GovernorSettings {
                minimum_gap: config.minimum_gap(),
                grace_period_requests: config.workers.grace_period_requests,
                grace_period_workers: config.workers.grace_period_workers,
            },
            health: HealthSettings {
                probe_interval: Duration::from_secs(config.extraction.probe_interval_secs),
                startup_probe_interval: Duration::from_secs(
                    config.extraction.startup_probe_interval_secs,
                ),
                startup_delay: Duration::from_secs(config.extraction.startup_delay_secs),
            },
            processor: ProcessorSettings::from_config(config),
        }
    }
}

pub struct Service {
    deps: Collaborators,
    settings: ServiceSettings,
    status: HealthStatus,
}

impl Service {
    pub fn new(deps: Collaborators, settings: ServiceSettings, status: HealthStatus) -> Self {
        Self {
            deps,
            settings,
            status,
        }
    }

    /// Run until `cancel` fires or a worker hits a fatal outcome
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ServiceError> {
        let settings = self.settings;
        let (sender, receiver) = mpsc::channel(settings.channel_capacity);

        let governor = Arc::new(RateGovernor::new(settings.governor));
        let processor = Arc::new(Processor::new(
            self.deps.clone(),
            governor,
            settings.processor.clone(),
        ));
        let pool = WorkerPool::new(processor, receiver, settings.workers, settings.idle_interval);

        let dispatcher = tokio::spawn(
            Dispatcher::new(self.deps.queue.clone(), sender).run(cancel.clone()),
        );

        let (start_tx, start_rx) = oneshot::channel();
        let gate = HealthGate::new(self.deps.extraction.clone(), self.status, settings.health, move || {
            let _ = start_tx.send(());
        });
        let health = tokio::spawn(gate.run(cancel.clone()));

        let fatal = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested before workers started");
                None
            }
            started = start_rx => match started {
                Ok(()) => pool.run(cancel.clone()).await,
                Err(_) => None,
            },
        };

        // Workers are gone; stop the rest
        cancel.cancel();
        match dispatcher.await {
            Ok(forwarded) => info!(forwarded, "Dispatcher joined"),
            Err(e) => warn!(error = %e, "Dispatcher task failed"),
        }
        if let Err(e) = health.await {
            warn!(error = %e, "Health task failed");
        }

        match fatal {
            Some(reason) => {
                error!(reason = %reason, "Service stopped on fatal error");
                Err(ServiceError::ExtractionUnreachable { reason })
            }
            None => {
                info!("Service stopped");
                Ok(())
            }
        }
    }
}
