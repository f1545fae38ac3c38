//! PaperIntake Ingestion Service
//!
//! 1. Loads configuration and sets up logging and metrics
//! 2. Connects to MySQL, Redis, S3, SQS and GROBID
//! 3. Serves `/health` and runs the ingestion service until shutdown
//!
//! Exits non-zero when the extraction service becomes unreachable.

use anyhow::Context;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use paperintake_common::{
    cache::Cache,
    config::{AppConfig, ObservabilityConfig},
    db::DbPool,
    metrics,
    queue::Queue,
    storage::S3BlobStore,
    BlobStore, Repository, VERSION,
};
use paperintake_ingestion::enrichment::{
    BibliographicLookup, CrossrefClient, Enricher, ExternalIdLookup, PubMedClient,
};
use paperintake_ingestion::extraction::GrobidClient;
use paperintake_ingestion::health::{self, HealthStatus};
use paperintake_ingestion::{Collaborators, Service, ServiceSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(&config.observability);

    info!(
        service = %config.observability.service_name,
        "Starting PaperIntake Ingestion Service v{}",
        VERSION
    );

    init_metrics(config.observability.metrics_port)?;

    // Relational store
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let store = Arc::new(Repository::new(db));
    store.ping().await?;

    // Outstanding-work counters
    let counter = Arc::new(Cache::new(&config.redis.url, config.redis.key_prefix.clone()).await?);
    counter.ping().await?;

    // AWS clients
    let mut aws = aws_config::defaults(aws_config::BehaviorVersion::latest());
    if let Some(region) = &config.storage.region {
        aws = aws.region(aws_config::Region::new(region.clone()));
    }
    let sdk_config = aws.load().await;
    let blobs = Arc::new(S3BlobStore::new(&sdk_config, config.storage.endpoint_url.as_deref()));
    info!(store = blobs.name(), bucket = %config.storage.bucket, "Blob store ready");
    let queue = Arc::new(Queue::new(&sdk_config, &config.queue));

    // Extraction and enrichment
    let extraction = Arc::new(GrobidClient::new(
        &config.extraction.base_url,
        config.extraction_timeout(),
    )?);
    let enricher = if config.enrichment.enabled {
        let crossref: Arc<dyn BibliographicLookup> = Arc::new(CrossrefClient::new(&config.enrichment)?);
        let pubmed: Arc<dyn ExternalIdLookup> = Arc::new(PubMedClient::new(&config.enrichment)?);
        Enricher::new(Some(crossref), Some(pubmed))
    } else {
        warn!("Bibliographic enrichment disabled");
        Enricher::disabled()
    };

    let deps = Collaborators {
        queue,
        blobs,
        counter,
        store,
        extraction,
        enricher,
    };

    let cancel = CancellationToken::new();
    let status = HealthStatus::default();

    // Health endpoint
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Health endpoint listening on {}", addr);
    let server = {
        let cancel = cancel.clone();
        let app = health::router(status.clone());
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
        })
    };

    tokio::spawn(shutdown_signal(cancel.clone()));

    let service = Service::new(deps, ServiceSettings::from_config(&config), status);
    let result = service.run(cancel.clone()).await;

    cancel.cancel();
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Health endpoint failed"),
        Err(e) => warn!(error = %e, "Health endpoint task failed"),
        Ok(Ok(())) => {}
    }

    result?;
    info!("Ingestion service shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_metrics(port: u16) -> anyhow::Result<()> {
    if port == 0 {
        info!("Metrics exporter disabled");
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .set_buckets_for_metric(
            Matcher::Suffix("extraction_duration_seconds".to_string()),
            metrics::EXTRACTION_BUCKETS,
        )?
        .install()
        .context("Failed to install Prometheus exporter")?;
    metrics::register_metrics();

    info!("Metrics exporter listening on port {}", port);
    Ok(())
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}
