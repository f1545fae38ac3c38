//! End-to-end pipeline tests against in-memory collaborators

use async_trait::async_trait;
use paperintake_common::cache::keys;
use paperintake_common::testing::{InMemoryBlobStore, InMemoryCounter, InMemoryPaperStore, InMemoryQueue};
use paperintake_common::QueueMessage;
use paperintake_ingestion::enrichment::{BibliographicLookup, EnrichedMetadata, Enricher, ExternalIdLookup};
use paperintake_ingestion::extraction::{ExtractionError, ExtractionService};
use paperintake_ingestion::health::{HealthSettings, HealthStatus};
use paperintake_ingestion::pool::WorkerPool;
use paperintake_ingestion::rate_governor::{GovernorSettings, RateGovernor};
use paperintake_ingestion::{
    Collaborators, Outcome, Processor, ProcessorSettings, Service, ServiceError, ServiceSettings,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::{LookupSpan, Registry};

const BUCKET: &str = "uploads";
const SCREEN: i64 = 9;

// ============================================================================
// Scripted collaborators
// ============================================================================

#[derive(Clone)]
enum Reply {
    Tei(String),
    Refused,
    Broken,
}

struct ScriptedExtraction {
    reply: Mutex<Reply>,
    alive: bool,
    calls: AtomicUsize,
}

impl ScriptedExtraction {
    fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            alive: true,
            calls: AtomicUsize::new(0),
        })
    }

    fn down() -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Reply::Refused),
            alive: false,
            calls: AtomicUsize::new(0),
        })
    }

    fn set(&self, reply: Reply) {
        *self.reply.lock().unwrap() = reply;
    }
}

#[async_trait]
impl ExtractionService for ScriptedExtraction {
    async fn process_fulltext(&self, _pdf: Vec<u8>) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.reply.lock().unwrap().clone() {
            Reply::Tei(xml) => Ok(xml),
            Reply::Refused => Err(ExtractionError::Unavailable("connection refused".into())),
            Reply::Broken => Err(ExtractionError::Failed("HTTP 500".into())),
        }
    }

    async fn is_alive(&self) -> bool {
        self.alive
    }
}

struct StubLookup {
    by_title: Option<EnrichedMetadata>,
}

#[async_trait]
impl BibliographicLookup for StubLookup {
    async fn by_doi(&self, _doi: &str) -> paperintake_common::Result<Option<EnrichedMetadata>> {
        Ok(None)
    }

    async fn by_title(&self, _title: &str) -> paperintake_common::Result<Option<EnrichedMetadata>> {
        Ok(self.by_title.clone())
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

struct StubIds;

#[async_trait]
impl ExternalIdLookup for StubIds {
    async fn pubmed_id(&self, doi: &str) -> paperintake_common::Result<Option<i64>> {
        Ok((doi == "10.5555/canonical").then_some(31_415))
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Minimal GROBID-shaped TEI document
fn tei(title: &str, doi: Option<&str>, abstract_text: &str, sections: &[(&str, &[&str])]) -> String {
    let idno = doi
        .map(|d| format!(r#"<idno type="DOI">{}</idno>"#, d))
        .unwrap_or_default();
    let abstract_p = if abstract_text.is_empty() {
        String::new()
    } else {
        format!("<div><p>{}</p></div>", abstract_text)
    };
    let body: String = sections
        .iter()
        .map(|(head, paragraphs)| {
            let ps: String = paragraphs.iter().map(|p| format!("<p>{}</p>", p)).collect();
            format!("<div><head>{}</head>{}</div>", head, ps)
        })
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<TEI xmlns="http://www.tei-c.org/ns/1.0">
  <teiHeader>
    <fileDesc>
      <titleStmt><title level="a" type="main">{title}</title></titleStmt>
      <sourceDesc><biblStruct>{idno}</biblStruct></sourceDesc>
    </fileDesc>
    <profileDesc><abstract>{abstract_p}</abstract></profileDesc>
  </teiHeader>
  <text><body>{body}</body></text>
</TEI>"#
    )
}

fn job_body(key: &str, extra: Option<(&str, Value)>) -> String {
    let mut body = json!({"s3Location": key, "user_id": "1", "screen_id": SCREEN.to_string()});
    if let Some((field, value)) = extra {
        body[field] = value;
    }
    body.to_string()
}

fn counter_key() -> String {
    keys::papers_processing(SCREEN)
}

fn no_grace() -> GovernorSettings {
    GovernorSettings {
        minimum_gap: Duration::ZERO,
        grace_period_requests: 0,
        grace_period_workers: 1,
    }
}

fn processor_settings(requeue: bool) -> ProcessorSettings {
    ProcessorSettings {
        bucket: BUCKET.to_string(),
        requeue_requests: requeue,
        requeue_visibility_secs: 30,
        settled_ttl: Duration::from_secs(3600),
    }
}

struct Harness {
    queue: Arc<InMemoryQueue>,
    blobs: Arc<InMemoryBlobStore>,
    counter: Arc<InMemoryCounter>,
    store: Arc<InMemoryPaperStore>,
    extraction: Arc<ScriptedExtraction>,
    enricher: Enricher,
}

impl Harness {
    fn new(reply: Reply) -> Self {
        Self::with_extraction(ScriptedExtraction::new(reply))
    }

    fn with_extraction(extraction: Arc<ScriptedExtraction>) -> Self {
        Self {
            queue: Arc::new(InMemoryQueue::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
            counter: Arc::new(InMemoryCounter::new()),
            store: Arc::new(InMemoryPaperStore::new()),
            extraction,
            enricher: Enricher::disabled(),
        }
    }

    fn collaborators(&self) -> Collaborators {
        Collaborators {
            queue: self.queue.clone(),
            blobs: self.blobs.clone(),
            counter: self.counter.clone(),
            store: self.store.clone(),
            extraction: self.extraction.clone(),
            enricher: self.enricher.clone(),
        }
    }

    fn processor(&self) -> Processor {
        self.processor_with(processor_settings(false))
    }

    fn processor_with(&self, settings: ProcessorSettings) -> Processor {
        Processor::new(self.collaborators(), Arc::new(RateGovernor::new(no_grace())), settings)
    }

    /// Upload a blob and enqueue its job, returning the received message
    fn submit(&self, key: &str) -> QueueMessage {
        self.submit_body(key, job_body(key, None))
    }

    fn submit_body(&self, key: &str, body: String) -> QueueMessage {
        self.blobs.put(BUCKET, key, b"%PDF-1.7".to_vec());
        self.queue.push(body);
        self.queue.pop().unwrap()
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[tokio::test]
async fn test_completed_job_persists_and_acknowledges() {
    let xml = include_str!("fixtures/sample_tei.xml").to_string();
    let h = Harness::new(Reply::Tei(xml));
    h.counter.set(&counter_key(), 2);
    let processor = h.processor();

    let message = h.submit("a.pdf");
    let receipt = message.receipt_handle.clone();
    assert_eq!(processor.handle(1, message).await, Outcome::Completed);

    let papers = h.store.papers();
    assert_eq!(papers.len(), 1);
    let paper = &papers[0];
    assert_eq!(paper.doi(), Some("10.1016/j.sleep.2020.01.004"));
    assert_eq!(paper.title, "Sleep Deprivation and Working Memory in Adolescents");
    assert_eq!((paper.user_id, paper.screen_id), (1, SCREEN));

    let sections = h.store.sections(paper.id);
    let headers: Vec<&str> = sections.iter().map(|s| s.header.as_str()).collect();
    assert_eq!(headers, vec!["abstract", "introduction", "introduction", "methods"]);
    let orders: Vec<i32> = sections.iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![0, 1, 2, 3]);

    assert_eq!(h.counter.value(&counter_key()), Some(1));
    assert_eq!(h.queue.deleted(), vec![receipt]);
    assert!(!h.blobs.contains(BUCKET, "a.pdf"));
    assert!(h.queue.sent().is_empty());
    assert!(h.store.logs().is_empty());
}

#[tokio::test]
async fn test_redelivered_job_reuses_paper_by_doi() {
    let xml = tei("Foo", Some("10.1/x"), "", &[("Intro", &["First paragraph."])]);
    let h = Harness::new(Reply::Tei(xml));
    h.counter.set(&counter_key(), 5);
    let processor = h.processor();

    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Completed);
    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Completed);

    let papers = h.store.papers();
    assert_eq!(papers.len(), 1);
    assert_eq!(papers[0].doi(), Some("10.1/x"));
    assert_eq!(papers[0].title, "Foo");

    // Same paragraph twice is skipped the second time
    let sections = h.store.sections(papers[0].id);
    assert_eq!(sections.len(), 1);
    assert_eq!((sections[0].order, sections[0].text.as_str()), (0, "First paragraph."));

    // One file, one decrement, however often it is delivered
    assert_eq!(h.counter.value(&counter_key()), Some(4));
    assert_eq!(h.counter.decrement_calls(), 1);
}

#[tokio::test]
async fn test_redelivery_after_success_is_acknowledged_quietly() {
    let h = Harness::new(Reply::Tei(tei("Foo", Some("10.1/x"), "", &[])));
    h.counter.set(&counter_key(), 5);
    let processor = h.processor();

    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Completed);
    assert!(!h.blobs.contains(BUCKET, "a.pdf"));

    // Visibility expired before the delete landed; same body comes back
    let receipt = h.queue.push(job_body("a.pdf", None));
    let again = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, again).await, Outcome::Redelivered);

    assert_eq!(h.counter.value(&counter_key()), Some(4));
    assert_eq!(h.counter.decrement_calls(), 1);
    assert!(h.store.logs().is_empty());
    assert!(h.queue.sent().is_empty());
    assert!(h.queue.deleted().contains(&receipt));
    assert_eq!(h.extraction.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_requeue_mode_replays_decrement_once() {
    let h = Harness::new(Reply::Tei(tei("Foo", Some("10.1/x"), "", &[])));
    h.counter.set(&counter_key(), 3);
    let processor = h.processor_with(processor_settings(true));

    for _ in 0..3 {
        assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Completed);
    }

    assert_eq!(h.counter.value(&counter_key()), Some(2));
    assert_eq!(h.counter.decrement_calls(), 1);
    assert_eq!(h.store.papers().len(), 1);
}

#[tokio::test]
async fn test_title_and_abstract_identify_paper_without_doi() {
    let h = Harness::new(Reply::Tei(tei("Bar", None, "Baz", &[])));
    h.counter.set(&counter_key(), 2);
    let processor = h.processor();

    assert_eq!(processor.handle(1, h.submit("first.pdf")).await, Outcome::Completed);
    assert_eq!(processor.handle(2, h.submit("second.pdf")).await, Outcome::Completed);

    let papers = h.store.papers();
    assert_eq!(papers.len(), 1);
    assert_eq!(papers[0].title, "Bar");
    assert_eq!(papers[0].abstract_text, "Baz");
    assert_eq!(papers[0].doi(), None);
    assert_eq!(h.counter.value(&counter_key()), None);
}

#[tokio::test]
async fn test_new_sections_continue_existing_order() {
    let h = Harness::new(Reply::Tei(tei(
        "Foo",
        Some("10.1/x"),
        "Summary.",
        &[("Intro", &["One.", "Two."])],
    )));
    h.counter.set(&counter_key(), 5);
    let processor = h.processor();
    processor.handle(1, h.submit("v1.pdf")).await;

    h.extraction.set(Reply::Tei(tei(
        "Foo",
        Some("10.1/x"),
        "Summary.",
        &[("Intro", &["Two."]), ("Results", &["Three."])],
    )));
    processor.handle(1, h.submit("v2.pdf")).await;

    let paper = &h.store.papers()[0];
    let sections: Vec<(i32, String)> = h
        .store
        .sections(paper.id)
        .into_iter()
        .map(|s| (s.order, s.text))
        .collect();
    assert_eq!(
        sections,
        vec![
            (0, "Summary.".to_string()),
            (1, "One.".to_string()),
            (2, "Two.".to_string()),
            (3, "Three.".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_enrichment_supplies_doi_and_pubmed_id() {
    let mut h = Harness::new(Reply::Tei(tei("canonical   title", None, "", &[])));
    let lookup: Arc<dyn BibliographicLookup> = Arc::new(StubLookup {
        by_title: Some(EnrichedMetadata {
            title: "Canonical Title".into(),
            year: "2019".into(),
            doi: "10.5555/canonical".into(),
            ..Default::default()
        }),
    });
    let ids: Arc<dyn ExternalIdLookup> = Arc::new(StubIds);
    h.enricher = Enricher::new(Some(lookup), Some(ids));
    let processor = h.processor();

    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Completed);

    let paper = &h.store.papers()[0];
    assert_eq!(paper.title, "Canonical Title");
    assert_eq!(paper.doi(), Some("10.5555/canonical"));
    assert_eq!(paper.year.as_deref(), Some("2019"));
    assert_eq!(paper.pubmed_id, Some(31_415));
}

#[tokio::test]
async fn test_requeue_mode_resets_visibility_and_keeps_blob() {
    let h = Harness::new(Reply::Tei(tei("Foo", Some("10.1/x"), "", &[])));
    let processor = h.processor_with(processor_settings(true));

    let message = h.submit("a.pdf");
    let receipt = message.receipt_handle.clone();
    assert_eq!(processor.handle(1, message).await, Outcome::Completed);

    assert_eq!(h.queue.visibility_changes(), vec![(receipt, 30)]);
    assert!(h.queue.deleted().is_empty());
    assert!(h.blobs.contains(BUCKET, "a.pdf"));
}

#[tokio::test]
async fn test_retried_job_does_not_decrement_on_success() {
    let h = Harness::new(Reply::Tei(tei("Foo", Some("10.1/x"), "", &[])));
    h.counter.set(&counter_key(), 3);
    let processor = h.processor();

    let body = job_body("a.pdf", Some(("decrement", json!(true))));
    assert_eq!(processor.handle(1, h.submit_body("a.pdf", body)).await, Outcome::Completed);
    assert_eq!(h.counter.value(&counter_key()), Some(3));
    assert_eq!(h.counter.decrement_calls(), 0);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let h = Harness::new(Reply::Broken);
    let processor = h.processor();

    h.queue.push("{\"s3Location\": \"a.pdf\"}");
    let message = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, message).await, Outcome::Dropped);

    assert!(h.queue.deleted().is_empty());
    assert!(h.queue.sent().is_empty());
    assert!(h.store.logs().is_empty());
    assert_eq!(h.extraction.calls.load(Ordering::SeqCst), 0);
    assert_eq!(processor.governor().completed(), 1);
}

#[tokio::test]
async fn test_failure_is_accounted_once_across_retries() {
    let h = Harness::new(Reply::Broken);
    h.counter.set(&counter_key(), 3);
    let processor = h.processor();

    let first = h.submit("a.pdf");
    let first_receipt = first.receipt_handle.clone();
    assert_eq!(processor.handle(1, first).await, Outcome::Failed);

    assert_eq!(h.counter.value(&counter_key()), Some(2));
    assert_eq!(h.queue.deleted(), vec![first_receipt]);
    assert!(h.blobs.contains(BUCKET, "a.pdf"));

    let logs = h.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].level, "error");
    assert_eq!(logs[0].stage, "extraction");
    assert_eq!((logs[0].user_id, logs[0].screen_id), (1, SCREEN));
    assert!(logs[0].user_message.contains("a.pdf"));

    let sent = h.queue.sent();
    assert_eq!(sent.len(), 1);
    let republished: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(republished["decrement"], json!(true));
    assert_eq!(republished["screen_id"], json!("9"));

    // Redelivery of the marked copy fails again
    let retry = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, retry).await, Outcome::Failed);

    assert_eq!(h.counter.value(&counter_key()), Some(2));
    assert_eq!(h.counter.decrement_calls(), 1);
    assert_eq!(h.store.logs().len(), 1);
    assert_eq!(h.queue.sent().len(), 1);
    assert_eq!(h.queue.pending_len(), 0);
}

#[tokio::test]
async fn test_missing_blob_fails_at_fetch_without_retry() {
    let h = Harness::new(Reply::Broken);
    h.counter.set(&counter_key(), 2);
    let receipt = h.queue.push(job_body("missing.pdf", None));
    let processor = h.processor();

    let message = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, message).await, Outcome::Failed);

    let logs = h.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].stage, "fetch");
    assert_eq!(h.extraction.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.counter.value(&counter_key()), Some(1));
    assert_eq!(h.queue.deleted(), vec![receipt]);
    assert!(h.queue.sent().is_empty());

    // A second delivery of the same job changes nothing
    h.queue.push(job_body("missing.pdf", None));
    let again = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, again).await, Outcome::Redelivered);
    assert_eq!(h.counter.value(&counter_key()), Some(1));
    assert_eq!(h.store.logs().len(), 1);
}

#[tokio::test]
async fn test_marked_job_without_blob_is_acknowledged() {
    let h = Harness::new(Reply::Broken);
    h.counter.set(&counter_key(), 2);
    let receipt = h.queue.push(job_body("a.pdf", Some(("decrement", json!(true)))));
    let processor = h.processor();

    let message = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, message).await, Outcome::Redelivered);

    assert_eq!(h.queue.deleted(), vec![receipt]);
    assert_eq!(h.counter.value(&counter_key()), Some(2));
    assert!(h.store.logs().is_empty());
    assert!(h.queue.sent().is_empty());
}

#[tokio::test]
async fn test_failed_redelivery_of_settled_job_is_not_logged_again() {
    let h = Harness::new(Reply::Tei(tei("Foo", Some("10.1/x"), "", &[])));
    h.counter.set(&counter_key(), 2);
    let processor = h.processor();
    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Completed);

    h.extraction.set(Reply::Broken);
    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Failed);

    assert_eq!(h.counter.value(&counter_key()), Some(1));
    assert!(h.store.logs().is_empty());
    let sent = h.queue.sent();
    assert_eq!(sent.len(), 1);
    let republished: Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(republished["decrement"], json!(true));
}

#[tokio::test]
async fn test_counter_outage_on_success_is_retried_once() {
    let h = Harness::new(Reply::Tei(tei("Foo", Some("10.1/x"), "", &[])));
    h.counter.set(&counter_key(), 2);
    h.counter.fail_next_settles(1);
    let processor = h.processor();

    assert_eq!(processor.handle(1, h.submit("a.pdf")).await, Outcome::Failed);

    assert_eq!(h.counter.value(&counter_key()), Some(1));
    let logs = h.store.logs();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].stage, "accounting");
    assert_eq!(h.queue.sent().len(), 1);

    // The marked copy completes without touching the counter again
    let retry = h.queue.pop().unwrap();
    assert_eq!(processor.handle(1, retry).await, Outcome::Completed);
    assert_eq!(h.counter.value(&counter_key()), Some(1));
    assert_eq!(h.store.papers().len(), 1);
}

#[tokio::test]
async fn test_unknown_fields_survive_republish() {
    let h = Harness::new(Reply::Broken);
    let processor = h.processor();

    let body = job_body("a.pdf", Some(("source", json!("upload-form"))));
    processor.handle(1, h.submit_body("a.pdf", body)).await;

    let republished: Value = serde_json::from_str(&h.queue.sent()[0]).unwrap();
    assert_eq!(republished["source"], json!("upload-form"));
    assert_eq!(republished["s3Location"], json!("a.pdf"));
}

#[tokio::test]
async fn test_refused_connection_is_fatal() {
    let h = Harness::new(Reply::Refused);
    h.counter.set(&counter_key(), 1);
    let processor = h.processor();

    let outcome = processor.handle(1, h.submit("a.pdf")).await;
    assert!(matches!(outcome, Outcome::Fatal(reason) if reason.contains("connection refused")));

    assert_eq!(h.counter.value(&counter_key()), Some(1));
    assert!(h.queue.deleted().is_empty());
    assert!(h.queue.sent().is_empty());
    assert!(h.store.logs().is_empty());
}

// ============================================================================
// Pool and service
// ============================================================================

#[tokio::test]
async fn test_pool_workers_share_one_paper() {
    let h = Harness::new(Reply::Tei(tei(
        "Foo",
        Some("10.1/x"),
        "Abs.",
        &[("Intro", &["One.", "Two."])],
    )));
    h.counter.set(&counter_key(), 8);
    let processor = Arc::new(h.processor());

    let (tx, rx) = mpsc::channel(8);
    for i in 0..8 {
        tx.send(h.submit(&format!("{}.pdf", i))).await.unwrap();
    }
    drop(tx);

    let fatal = WorkerPool::new(processor.clone(), rx, 4, Duration::from_millis(5))
        .run(CancellationToken::new())
        .await;
    assert_eq!(fatal, None);

    let papers = h.store.papers();
    assert_eq!(papers.len(), 1);
    let orders: Vec<i32> = h.store.sections(papers[0].id).iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert_eq!(h.counter.value(&counter_key()), None);
    assert_eq!(processor.governor().completed(), 8);
}

// ============================================================================
// Worker attribution
// ============================================================================

#[derive(Clone, Copy)]
struct WorkerTag(usize);

#[derive(Default)]
struct WorkerIdVisitor(Option<usize>);

impl Visit for WorkerIdVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "worker_id" {
            self.0 = Some(value as usize);
        }
    }

    fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
}

/// Tags every `worker` span with its worker id
struct WorkerTagLayer;

impl<S> Layer<S> for WorkerTagLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != "worker" {
            return;
        }
        let mut visitor = WorkerIdVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(worker_id), Some(span)) = (visitor.0, ctx.span(id)) {
            span.extensions_mut().insert(WorkerTag(worker_id));
        }
    }
}

/// Id of the pool worker whose span encloses the current one
fn current_worker() -> Option<usize> {
    tracing::Span::current()
        .with_subscriber(|(id, dispatch)| {
            let registry = dispatch.downcast_ref::<Registry>()?;
            let span = registry.span(id)?;
            let worker = span.scope().find_map(|s| {
                let tag = s.extensions().get::<WorkerTag>().copied();
                tag.map(|tag| tag.0)
            });
            worker
        })
        .flatten()
}

/// Extraction fake that notes which worker made each call
struct AttributedExtraction {
    xml: String,
    callers: Mutex<Vec<Option<usize>>>,
}

#[async_trait]
impl ExtractionService for AttributedExtraction {
    async fn process_fulltext(&self, _pdf: Vec<u8>) -> Result<String, ExtractionError> {
        self.callers.lock().unwrap().push(current_worker());
        // Long enough for idle workers to grab messages if they were allowed
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(self.xml.clone())
    }

    async fn is_alive(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_grace_period_keeps_extraction_on_first_worker() {
    let _subscriber = tracing::subscriber::set_default(Registry::default().with(WorkerTagLayer));

    let h = Harness::new(Reply::Broken);
    let extraction = Arc::new(AttributedExtraction {
        xml: tei("Foo", Some("10.1/x"), "", &[("Intro", &["One."])]),
        callers: Mutex::new(Vec::new()),
    });
    let mut deps = h.collaborators();
    deps.extraction = extraction.clone();

    let governor = Arc::new(RateGovernor::new(GovernorSettings {
        minimum_gap: Duration::ZERO,
        grace_period_requests: 3,
        grace_period_workers: 1,
    }));
    let processor = Arc::new(Processor::new(deps, governor, processor_settings(false)));

    let (tx, rx) = mpsc::channel(6);
    for i in 0..6 {
        tx.send(h.submit(&format!("{}.pdf", i))).await.unwrap();
    }
    drop(tx);

    let fatal = WorkerPool::new(processor.clone(), rx, 3, Duration::from_millis(5))
        .run(CancellationToken::new())
        .await;
    assert_eq!(fatal, None);

    let callers = extraction.callers.lock().unwrap().clone();
    assert_eq!(callers.len(), 6);
    assert_eq!(&callers[..3], &[Some(1), Some(1), Some(1)]);
    assert!(callers.iter().all(|c| matches!(c, Some(1..=3))));
    assert_eq!(processor.governor().completed(), 6);
}

fn service_settings() -> ServiceSettings {
    ServiceSettings {
        workers: 2,
        idle_interval: Duration::from_millis(5),
        channel_capacity: 4,
        governor: no_grace(),
        health: HealthSettings {
            probe_interval: Duration::from_millis(50),
            startup_probe_interval: Duration::from_millis(10),
            startup_delay: Duration::ZERO,
        },
        processor: processor_settings(false),
    }
}

#[tokio::test]
async fn test_service_exits_with_error_when_extraction_is_unreachable() {
    let h = Harness::new(Reply::Refused);
    h.blobs.put(BUCKET, "a.pdf", b"%PDF".to_vec());
    h.queue.push(job_body("a.pdf", None));

    let status = HealthStatus::default();
    let service = Service::new(h.collaborators(), service_settings(), status.clone());
    let cancel = CancellationToken::new();

    let result = tokio::time::timeout(Duration::from_secs(5), service.run(cancel.clone()))
        .await
        .expect("service should stop on its own");

    assert!(matches!(result, Err(ServiceError::ExtractionUnreachable { .. })));
    assert!(cancel.is_cancelled());
    assert!(status.is_healthy());
}

#[tokio::test]
async fn test_service_waits_for_health_before_consuming() {
    let h = Harness::with_extraction(ScriptedExtraction::down());
    h.blobs.put(BUCKET, "a.pdf", b"%PDF".to_vec());
    h.queue.push(job_body("a.pdf", None));

    let service = Service::new(h.collaborators(), service_settings(), HealthStatus::default());
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(service.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.extraction.calls.load(Ordering::SeqCst), 0);
    assert!(h.queue.deleted().is_empty());

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("service should stop after cancel")
        .unwrap();
    assert!(result.is_ok());
}
