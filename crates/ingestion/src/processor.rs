//! Ingestion processor
//!
//! Runs one queue message through the pipeline:
//! fetch PDF → extract → enrich → merge → backfill → resolve paper →
//! persist sections → decrement counter → acknowledge.
//!
//! Failures go through `handle_failure`, which logs, decrements and
//! re-publishes a job exactly once; the `decrement` marker on the
//! re-published copy stops a second failure from doing it again.
//!
//! Every decrement is settled against a per-file marker in the counter
//! store, so a redelivered job (expired visibility, failed delete, replay
//! mode) never decrements twice. A redelivery whose PDF was already consumed
//! is acknowledged without logging.

use crate::document::{DocumentRecord, ExtractedDocument};
use crate::enrichment::Enricher;
use crate::errors::{IngestError, Stage};
use crate::extraction::{tei, ExtractionService};
use crate::job::Job;
use crate::rate_governor::{Admission, RateGovernor};
use crate::resolver::{Resolver, SectionStats};
use paperintake_common::config::AppConfig;
use paperintake_common::db::NewLogEntry;
use paperintake_common::{
    metrics, BlobStore, MessageQueue, PaperStore, QueueMessage, Settlement, WorkCounter,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// External services the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn MessageQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub counter: Arc<dyn WorkCounter>,
    pub store: Arc<dyn PaperStore>,
    pub extraction: Arc<dyn ExtractionService>,
    pub enricher: Enricher,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    /// Bucket holding uploaded PDFs
    pub bucket: String,
    /// Reset visibility instead of deleting on success (replay mode)
    pub requeue_requests: bool,
    pub requeue_visibility_secs: i32,
    /// Lifetime of the per-file settled marker
    pub settled_ttl: Duration,
}

impl ProcessorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            bucket: config.storage.bucket.clone(),
            requeue_requests: config.queue.requeue_requests,
            requeue_visibility_secs: config.queue.requeue_visibility_secs,
            settled_ttl: config.settled_ttl(),
        }
    }
}

/// How a message was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Pipeline finished and the message was acknowledged
    Completed,
    /// Undecodable message, left for the queue to expire
    Dropped,
    /// Pipeline failed; failure handling ran (or was already done)
    Failed,
    /// An earlier delivery already finished this job; acknowledged only
    Redelivered,
    /// Extraction service unreachable; the service must stop
    Fatal(String),
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Dropped => "dropped",
            Outcome::Failed => "failed",
            Outcome::Redelivered => "redelivered",
            Outcome::Fatal(_) => "fatal",
        }
    }
}

/// Result of a successful pipeline run
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub paper_id: i64,
    pub created: bool,
    pub sections: SectionStats,
}

pub struct Processor {
    deps: Collaborators,
    resolver: Resolver,
    governor: Arc<RateGovernor>,
    settings: ProcessorSettings,
}

impl Processor {
    pub fn new(deps: Collaborators, governor: Arc<RateGovernor>, settings: ProcessorSettings) -> Self {
        let resolver = Resolver::new(deps.store.clone(), deps.enricher.clone());
        Self {
            deps,
            resolver,
            governor,
            settings,
        }
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    /// Handle one message end to end
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn handle(&self, worker_id: usize, message: QueueMessage) -> Outcome {
        let started = Instant::now();

        let outcome = match Job::decode(&message.body) {
            Err(e) => {
                warn!(error = %e, "Dropping malformed message");
                Outcome::Dropped
            }
            Ok(job) => match self.run(&job, &message).await {
                Ok(summary) => {
                    info!(
                        paper_id = summary.paper_id,
                        created = summary.created,
                        sections_inserted = summary.sections.inserted,
                        sections_skipped = summary.sections.skipped,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Job completed"
                    );
                    Outcome::Completed
                }
                Err(e) if e.is_fatal() => {
                    error!(error = %e, blob = %job.blob_location, "Extraction service unreachable");
                    metrics::record_failure(e.stage().as_str());
                    Outcome::Fatal(e.to_string())
                }
                Err(e) => self.handle_failure(&job, &message, &e).await,
            },
        };

        let completed = self.governor.record_completion();
        debug!(completed, outcome = outcome.as_str(), "Message handled");
        metrics::record_job(started.elapsed().as_secs_f64(), outcome.as_str());
        outcome
    }

    async fn run(&self, job: &Job, message: &QueueMessage) -> Result<JobSummary, IngestError> {
        // 1. Fetch
        let pdf = match self.deps.blobs.get(&self.settings.bucket, &job.blob_location).await {
            Ok(pdf) => pdf,
            Err(e) if e.is_not_found() => {
                return Err(IngestError::SourceMissing(job.blob_location.clone()))
            }
            Err(e) => return Err(IngestError::retryable(Stage::Fetch, e)),
        };
        debug!(bytes = pdf.len(), "PDF fetched");

        // 2. Extract
        if let Admission::Paced { waited, .. } = self.governor.pace().await {
            debug!(waited_ms = waited.as_millis() as u64, "Extraction call paced");
        }
        let extraction_started = Instant::now();
        let extracted = self.deps.extraction.process_fulltext(pdf).await;
        metrics::record_extraction(extraction_started.elapsed().as_secs_f64(), extracted.is_ok());
        let document = ExtractedDocument::from_tei(tei::parse(&extracted?)?);

        // 3. Enrich and merge
        let enriched = self.deps.enricher.lookup(&document.doi, &document.title).await;
        let mut record = DocumentRecord::merge(document, enriched.as_ref());
        debug!(
            authors = record.authors.len(),
            keywords = record.keywords.len(),
            enriched = enriched.is_some(),
            "Document merged"
        );

        // 4. Resolve
        self.resolver.backfill_from_screen(job.screen_id, &mut record).await;
        let resolved = self
            .resolver
            .resolve_paper(job.user_id, job.screen_id, &record)
            .await?;
        let sections = self
            .resolver
            .persist_sections(&resolved, &record.section_drafts())
            .await?;

        // 5. Account
        if !job.retry_marker {
            self.settle(job).await.map_err(|e| IngestError::retryable(Stage::Accounting, e))?;
        }

        // 6. Acknowledge
        self.acknowledge(job, message).await;

        Ok(JobSummary {
            paper_id: resolved.paper.id,
            created: resolved.created,
            sections,
        })
    }

    /// Decrement the screen's counter unless this file was already settled
    async fn settle(&self, job: &Job) -> paperintake_common::Result<Settlement> {
        let key = job.counter_key();
        let settlement = self
            .deps
            .counter
            .settle(&key, &job.settled_marker(), self.settings.settled_ttl)
            .await?;
        match settlement {
            Settlement::Decremented(remaining) => {
                debug!(key = %key, remaining, "Outstanding work decremented")
            }
            Settlement::CounterMissing => warn!(key = %key, "Outstanding-work counter missing"),
            Settlement::AlreadySettled => debug!(key = %key, "Job already settled, counter untouched"),
        }
        Ok(settlement)
    }

    /// Delete the message, or just hide it again in replay mode
    async fn acknowledge_message(&self, message: &QueueMessage) {
        let queue = &self.deps.queue;

        if self.settings.requeue_requests {
            if let Err(e) = queue
                .change_visibility(&message.receipt_handle, self.settings.requeue_visibility_secs)
                .await
            {
                warn!(error = %e, "Failed to reset message visibility");
            }
            return;
        }

        if let Err(e) = queue.delete(&message.receipt_handle).await {
            warn!(error = %e, "Failed to delete message");
        }
    }

    /// Acknowledge the message and, outside replay mode, delete the PDF
    async fn acknowledge(&self, job: &Job, message: &QueueMessage) {
        self.acknowledge_message(message).await;
        if self.settings.requeue_requests {
            return;
        }

        if let Err(e) = self
            .deps
            .blobs
            .delete(&self.settings.bucket, &job.blob_location)
            .await
        {
            warn!(error = %e, blob = %job.blob_location, "Failed to delete PDF");
        }
    }

    /// Log the failure for the user, settle the counter and re-publish the
    /// job once with the retry marker set
    #[instrument(skip(self, job, message, err), fields(stage = %err.stage(), retry_marker = job.retry_marker))]
    async fn handle_failure(&self, job: &Job, message: &QueueMessage, err: &IngestError) -> Outcome {
        if job.retry_marker {
            if err.is_source_missing() {
                info!(blob = %job.blob_location, "PDF already consumed by an earlier delivery");
                self.acknowledge_message(message).await;
                return Outcome::Redelivered;
            }
            metrics::record_failure(err.stage().as_str());
            warn!(error = %err, blob = %job.blob_location, "Retried job failed again, leaving it to the queue");
            return Outcome::Failed;
        }

        let already_settled = match self.settle(job).await {
            Ok(settlement) => settlement == Settlement::AlreadySettled,
            Err(e) => {
                warn!(error = %e, "Failed to decrement counter for failed job");
                false
            }
        };

        if already_settled && err.is_source_missing() {
            info!(blob = %job.blob_location, "PDF already consumed by an earlier delivery");
            self.acknowledge_message(message).await;
            return Outcome::Redelivered;
        }
        metrics::record_failure(err.stage().as_str());

        if already_settled {
            warn!(error = %err, blob = %job.blob_location, "Settled job failed on redelivery");
        } else {
            error!(error = %err, blob = %job.blob_location, "Job failed");
            let entry = NewLogEntry {
                level: "error".to_string(),
                user_message: format!("Failed to process file {}", job.blob_location),
                full_log: err.to_string(),
                stage: err.stage().as_str().to_string(),
                user_id: job.user_id,
                screen_id: job.screen_id,
            };
            if let Err(e) = self.deps.store.save_log(entry).await {
                warn!(error = %e, "Failed to save failure log entry");
            }
        }

        if err.is_source_missing() {
            self.acknowledge_message(message).await;
            return Outcome::Failed;
        }

        // The unmarked message must be gone before the marked copy exists
        if let Err(e) = self.deps.queue.delete(&message.receipt_handle).await {
            error!(error = %e, "Failed to delete failed message, not re-publishing");
            return Outcome::Failed;
        }

        let body = match job.marked_for_retry().to_body() {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode retry message");
                return Outcome::Failed;
            }
        };
        match self.deps.queue.send_body(&body).await {
            Ok(message_id) => info!(message_id = %message_id, "Job re-published for retry"),
            Err(e) => error!(error = %e, "Failed to re-publish job"),
        }
        Outcome::Failed
    }
}
