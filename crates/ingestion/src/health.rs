//! Health gate and health endpoint
//!
//! The gate probes the extraction service and starts the worker pool on the
//! first healthy probe, exactly once. Later probes only flip the shared
//! [`HealthStatus`] that `/health` reports.
//!
//! Endpoint contract:
//! - `GET /health` answers `{"healthy": bool}` with 200 when the extraction
//!   service is up and 503 when it is down, so probes may key on the status
//!   code alone. Earlier deployments always answered 200.
//! - `GET /` answers `{"service", "version"}`, not the host name.

use crate::extraction::ExtractionService;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use paperintake_common::{metrics, SERVICE_NAME, VERSION};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Last known extraction-service health, shared with the HTTP endpoint
#[derive(Debug, Clone, Default)]
pub struct HealthStatus(Arc<AtomicBool>);

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Store the new state, returning the previous one
    pub fn set(&self, healthy: bool) -> bool {
        self.0.swap(healthy, Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthSettings {
    /// Probe interval once the pool is running
    pub probe_interval: Duration,
    /// Probe interval while waiting for the first healthy probe
    pub startup_probe_interval: Duration,
    /// Warm-up delay between the first healthy probe and starting the pool
    pub startup_delay: Duration,
}

type StartCallback = Box<dyn FnOnce() + Send>;

pub struct HealthGate {
    extraction: Arc<dyn ExtractionService>,
    status: HealthStatus,
    settings: HealthSettings,
    on_first_healthy: Option<StartCallback>,
}

impl HealthGate {
    pub fn new(
        extraction: Arc<dyn ExtractionService>,
        status: HealthStatus,
        settings: HealthSettings,
        on_first_healthy: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            extraction,
            status,
            settings,
            on_first_healthy: Some(Box::new(on_first_healthy)),
        }
    }

    /// Whether the start callback has already fired
    pub fn started(&self) -> bool {
        self.on_first_healthy.is_none()
    }

    /// Probe once, firing the start callback on the first healthy result
    pub async fn probe(&mut self, cancel: &CancellationToken) -> bool {
        let healthy = self.extraction.is_alive().await;
        let was_healthy = self.status.set(healthy);
        metrics::record_health(healthy);

        match (was_healthy, healthy) {
            (false, true) => info!("Extraction service is healthy"),
            (true, false) => warn!("Extraction service became unhealthy"),
            (false, false) if !self.started() => warn!("Extraction service not ready yet"),
            _ => {}
        }

        if healthy {
            if let Some(start) = self.on_first_healthy.take() {
                if !self.settings.startup_delay.is_zero() {
                    info!(delay_secs = self.settings.startup_delay.as_secs(), "Waiting before starting workers");
                    tokio::select! {
                        _ = cancel.cancelled() => return healthy,
                        _ = tokio::time::sleep(self.settings.startup_delay) => {}
                    }
                }
                info!("Starting worker pool");
                start();
            }
        }
        healthy
    }

    /// Probe until cancelled
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            self.probe(&cancel).await;

            let interval = if self.started() {
                self.settings.probe_interval
            } else {
                self.settings.startup_probe_interval
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Health gate stopped");
    }
}

// ============================================================================
// HTTP endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthBody {
    healthy: bool,
}

#[derive(Serialize)]
struct ServiceInfo {
    service: &'static str,
    version: &'static str,
}

pub fn router(status: HealthStatus) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(status)
}

async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: SERVICE_NAME,
        version: VERSION,
    })
}

async fn health(State(status): State<HealthStatus>) -> impl IntoResponse {
    let healthy = status.is_healthy();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthBody { healthy }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::ExtractionError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Replays scripted probe results, then stays on the last one
    struct ScriptedProbe {
        results: Mutex<Vec<bool>>,
        probes: AtomicUsize,
    }

    impl ScriptedProbe {
        fn new(results: &[bool]) -> Arc<Self> {
            let mut results = results.to_vec();
            results.reverse();
            Arc::new(Self {
                results: Mutex::new(results),
                probes: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExtractionService for ScriptedProbe {
        async fn process_fulltext(&self, _pdf: Vec<u8>) -> Result<String, ExtractionError> {
            Err(ExtractionError::Failed("not scripted".into()))
        }

        async fn is_alive(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.pop().unwrap()
            } else {
                results[0]
            }
        }
    }

    fn settings() -> HealthSettings {
        HealthSettings {
            probe_interval: Duration::from_secs(60),
            startup_probe_interval: Duration::from_secs(5),
            startup_delay: Duration::from_secs(10),
        }
    }

    fn counting_gate(probe: Arc<ScriptedProbe>, status: HealthStatus) -> (HealthGate, Arc<AtomicUsize>) {
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = starts.clone();
        let gate = HealthGate::new(probe, status, settings(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (gate, starts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_once_across_flaps() {
        let probe = ScriptedProbe::new(&[false, true, false, true, true]);
        let status = HealthStatus::default();
        let (mut gate, starts) = counting_gate(probe, status.clone());
        let cancel = CancellationToken::new();

        assert!(!gate.probe(&cancel).await);
        assert_eq!(starts.load(Ordering::SeqCst), 0);

        assert!(gate.probe(&cancel).await);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        assert!(!gate.probe(&cancel).await);
        assert!(!status.is_healthy());

        gate.probe(&cancel).await;
        gate.probe(&cancel).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(status.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_precedes_start() {
        let probe = ScriptedProbe::new(&[true]);
        let (mut gate, starts) = counting_gate(probe, HealthStatus::default());
        let cancel = CancellationToken::new();

        let before = tokio::time::Instant::now();
        gate.probe(&cancel).await;
        assert!(before.elapsed() >= Duration::from_secs(10));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_uses_startup_interval_until_healthy() {
        let probe = ScriptedProbe::new(&[false, false, true]);
        let (gate, starts) = counting_gate(probe.clone(), HealthStatus::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(gate.run(cancel.clone()));

        // Probes at 0s and 5s fail, 10s succeeds, start fires after the 10s delay
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        // Next probe only after the long interval
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(probe.probes.load(Ordering::SeqCst), 4);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint_reports_status() {
        let status = HealthStatus::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(status.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("http://{}/health", addr);
        let down = reqwest::get(&url).await.unwrap();
        assert_eq!(down.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = down.json().await.unwrap();
        assert_eq!(body["healthy"], false);

        status.set(true);
        let up: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(up["healthy"], true);

        let info: serde_json::Value = reqwest::get(format!("http://{}/", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["service"], SERVICE_NAME);
    }
}
