//! Request-rate governor protecting the extraction service
//!
//! During the grace period (the first `grace_period_requests` completed jobs)
//! only workers with id `<= grace_period_workers` may take messages, and
//! extraction calls across all workers are spaced at least `minimum_gap`
//! apart. Once enough jobs complete, the governor gets out of the way.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Result of pacing a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Grace period over, no pacing applied
    Open,
    /// Call slot stamped at `at` after waiting `waited`
    Paced { waited: Duration, at: Instant },
}

/// Governor settings
#[derive(Debug, Clone, Copy)]
pub struct GovernorSettings {
    pub minimum_gap: Duration,
    pub grace_period_requests: u64,
    pub grace_period_workers: usize,
}

pub struct RateGovernor {
    settings: GovernorSettings,
    last_request: Mutex<Option<Instant>>,
    admission: Semaphore,
    completed: AtomicU64,
}

impl RateGovernor {
    pub fn new(settings: GovernorSettings) -> Self {
        Self {
            settings,
            last_request: Mutex::new(None),
            admission: Semaphore::new(1),
            completed: AtomicU64::new(0),
        }
    }

    /// Whether the startup ramp is still in effect
    pub fn in_grace_period(&self) -> bool {
        self.completed.load(Ordering::Acquire) < self.settings.grace_period_requests
    }

    /// Whether `worker_id` may take a message right now
    pub fn may_consume(&self, worker_id: usize) -> bool {
        !self.in_grace_period() || worker_id <= self.settings.grace_period_workers
    }

    /// Wait out the minimum gap since the previous call and stamp a new one.
    ///
    /// The check-sleep-stamp sequence runs under a single-permit semaphore,
    /// so stamps from concurrent workers are always at least `minimum_gap`
    /// apart.
    pub async fn pace(&self) -> Admission {
        if !self.in_grace_period() {
            return Admission::Open;
        }

        // The semaphore is never closed
        let Ok(_permit) = self.admission.acquire().await else {
            return Admission::Open;
        };

        let previous = *self.last_request.lock().await;
        let mut waited = Duration::ZERO;
        if let Some(previous) = previous {
            let elapsed = previous.elapsed();
            if elapsed < self.settings.minimum_gap {
                waited = self.settings.minimum_gap - elapsed;
                debug!(wait_ms = waited.as_millis() as u64, "Pacing extraction call");
                sleep(waited).await;
            }
        }

        let at = Instant::now();
        *self.last_request.lock().await = Some(at);
        Admission::Paced { waited, at }
    }

    /// Count a finished job (any outcome) towards ending the grace period
    pub fn record_completion(&self) -> u64 {
        self.completed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}
