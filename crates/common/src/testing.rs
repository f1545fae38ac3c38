//! In-memory collaborators for tests
//!
//! Mirror the contracts of the SQS, S3, Redis and MySQL implementations
//! closely enough to drive the whole ingestion pipeline without network
//! access. Each fake exposes inspection helpers and failure injection.

use crate::cache::{Settlement, WorkCounter};
use crate::db::models::{Paper, Section};
use crate::db::{generate_slug, NewLogEntry, NewPaper, PaperStore};
use crate::errors::{AppError, Result};
use crate::queue::{MessageQueue, QueueMessage};
use crate::storage::BlobStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement a counter that must not go below zero; returns whether it fired
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueueMessage>,
    sent: Vec<String>,
    deleted: Vec<String>,
    visibility: Vec<(String, i32)>,
    next_id: u64,
}

/// FIFO queue; published bodies become receivable again
#[derive(Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    fail_receives: AtomicUsize,
    receives: AtomicUsize,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a body as if a producer had sent it; returns its receipt handle
    pub fn push(&self, body: impl Into<String>) -> String {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        let message = QueueMessage {
            message_id: format!("msg-{}", id),
            receipt_handle: format!("rh-{}", id),
            body: body.into(),
        };
        let receipt = message.receipt_handle.clone();
        state.pending.push_back(message);
        receipt
    }

    /// Fail the next `n` receive calls
    pub fn fail_next_receives(&self, n: usize) {
        self.fail_receives.store(n, Ordering::SeqCst);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Remove and return the next pending message without going through `receive`
    pub fn pop(&self) -> Option<QueueMessage> {
        lock(&self.state).pending.pop_front()
    }

    /// Bodies published through `send_body`
    pub fn sent(&self) -> Vec<String> {
        lock(&self.state).sent.clone()
    }

    /// Receipt handles deleted so far
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.state).deleted.clone()
    }

    /// `(receipt_handle, seconds)` visibility changes
    pub fn visibility_changes(&self) -> Vec<(String, i32)> {
        lock(&self.state).visibility.clone()
    }

    pub fn receive_calls(&self) -> usize {
        self.receives.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn receive(&self) -> Result<Vec<QueueMessage>> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.fail_receives) {
            return Err(AppError::QueueError {
                message: "injected receive failure".into(),
            });
        }

        let batch: Vec<QueueMessage> = {
            let mut state = lock(&self.state);
            let n = state.pending.len().min(10);
            state.pending.drain(..n).collect()
        };

        if batch.is_empty() {
            // Stand-in for the long-poll wait
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(batch)
    }

    async fn send_body(&self, body: &str) -> Result<String> {
        lock(&self.state).sent.push(body.to_string());
        let receipt = self.push(body);
        Ok(receipt.replace("rh-", "msg-"))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<()> {
        lock(&self.state).deleted.push(receipt_handle.to_string());
        Ok(())
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: i32) -> Result<()> {
        lock(&self.state)
            .visibility
            .push((receipt_handle.to_string(), seconds));
        Ok(())
    }
}

// ============================================================================
// Blob store
// ============================================================================

/// Bucket/key map of blobs
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    deleted: Mutex<Vec<String>>,
    fail_gets: AtomicUsize,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, bytes: impl Into<Vec<u8>>) {
        lock(&self.objects).insert((bucket.to_string(), key.to_string()), bytes.into());
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        lock(&self.objects).contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Keys deleted so far
    pub fn deleted(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    /// Fail the next `n` get calls
    pub fn fail_next_gets(&self, n: usize) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        if take_one(&self.fail_gets) {
            return Err(AppError::StorageError {
                message: format!("injected failure fetching {}/{}", bucket, key),
            });
        }
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| AppError::NotFound {
                resource: format!("{}/{}", bucket, key),
            })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        lock(&self.objects).remove(&(bucket.to_string(), key.to_string()));
        lock(&self.deleted).push(key.to_string());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Counter
// ============================================================================

/// Keyed counter with marker-guarded decrement-or-delete semantics.
/// Marker TTLs are ignored.
#[derive(Default)]
pub struct InMemoryCounter {
    values: Mutex<HashMap<String, i64>>,
    markers: Mutex<HashSet<String>>,
    decrements: AtomicUsize,
    fail_settles: AtomicUsize,
}

impl InMemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: i64) {
        lock(&self.values).insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> Option<i64> {
        lock(&self.values).get(key).copied()
    }

    /// Decrements actually applied so far
    pub fn decrement_calls(&self) -> usize {
        self.decrements.load(Ordering::SeqCst)
    }

    pub fn is_settled(&self, marker: &str) -> bool {
        lock(&self.markers).contains(marker)
    }

    /// Fail the next `n` settle calls
    pub fn fail_next_settles(&self, n: usize) {
        self.fail_settles.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl WorkCounter for InMemoryCounter {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut values = lock(&self.values);
        let value = values.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn settle(&self, key: &str, marker: &str, _ttl: Duration) -> Result<Settlement> {
        if take_one(&self.fail_settles) {
            return Err(AppError::CacheError {
                message: format!("injected failure settling {}", key),
            });
        }
        if !lock(&self.markers).insert(marker.to_string()) {
            return Ok(Settlement::AlreadySettled);
        }

        let mut values = lock(&self.values);
        let settled = match values.get(key).copied() {
            None => return Ok(Settlement::CounterMissing),
            Some(current) if current > 1 => {
                values.insert(key.to_string(), current - 1);
                Settlement::Decremented(current - 1)
            }
            Some(_) => {
                values.remove(key);
                Settlement::Decremented(0)
            }
        };
        self.decrements.fetch_add(1, Ordering::SeqCst);
        Ok(settled)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.value(key))
    }
}

// ============================================================================
// Paper store
// ============================================================================

#[derive(Default)]
struct StoreState {
    papers: Vec<Paper>,
    sections: Vec<Section>,
    logs: Vec<NewLogEntry>,
    next_paper_id: i64,
    next_section_id: i64,
}

/// Relational store held in vectors
#[derive(Default)]
pub struct InMemoryPaperStore {
    state: Mutex<StoreState>,
    fail_lookups: AtomicBool,
    fail_logs: AtomicBool,
    fail_section_text: Mutex<Option<String>>,
}

impl InMemoryPaperStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every paper lookup return a database error
    pub fn fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make `save_log` fail
    pub fn fail_logs(&self, fail: bool) {
        self.fail_logs.store(fail, Ordering::SeqCst);
    }

    /// Make section inserts whose text equals `text` fail
    pub fn fail_section_with_text(&self, text: Option<&str>) {
        *lock(&self.fail_section_text) = text.map(str::to_string);
    }

    pub fn papers(&self) -> Vec<Paper> {
        lock(&self.state).papers.clone()
    }

    /// Sections of a paper ordered by position
    pub fn sections(&self, paper_id: i64) -> Vec<Section> {
        let mut sections: Vec<Section> = lock(&self.state)
            .sections
            .iter()
            .filter(|s| s.paper_id == paper_id)
            .cloned()
            .collect();
        sections.sort_by_key(|s| s.order);
        sections
    }

    pub fn logs(&self) -> Vec<NewLogEntry> {
        lock(&self.state).logs.clone()
    }

    fn check_lookup(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: "injected lookup failure".into(),
            });
        }
        Ok(())
    }

    fn first_match(&self, pred: impl Fn(&Paper) -> bool) -> Option<Paper> {
        lock(&self.state).papers.iter().find(|p| pred(p)).cloned()
    }
}

#[async_trait]
impl PaperStore for InMemoryPaperStore {
    async fn find_paper_by_doi(&self, screen_id: i64, doi: &str) -> Result<Option<Paper>> {
        self.check_lookup()?;
        Ok(self.first_match(|p| p.screen_id == screen_id && p.doi.as_deref() == Some(doi)))
    }

    async fn find_paper_by_title_and_abstract(
        &self,
        screen_id: i64,
        title: &str,
        abstract_text: &str,
    ) -> Result<Option<Paper>> {
        self.check_lookup()?;
        Ok(self.first_match(|p| {
            p.screen_id == screen_id && p.title == title && p.abstract_text == abstract_text
        }))
    }

    async fn find_paper_by_title(&self, screen_id: i64, title: &str) -> Result<Option<Paper>> {
        self.check_lookup()?;
        Ok(self.first_match(|p| p.screen_id == screen_id && p.title == title))
    }

    async fn create_paper(&self, paper: NewPaper) -> Result<Paper> {
        paper.validate()?;
        let now = chrono::Utc::now().naive_utc();
        let mut state = lock(&self.state);
        state.next_paper_id += 1;
        let model = Paper {
            id: state.next_paper_id,
            slug: generate_slug(),
            custom_key: None,
            issn: paper.issn.filter(|v| !v.is_empty()),
            doi: paper.doi.filter(|v| !v.is_empty()),
            user_id: paper.user_id,
            screen_id: paper.screen_id,
            pubmed_id: paper.pubmed_id,
            title: paper.title,
            abstract_text: paper.abstract_text,
            journal: None,
            year: paper.year.filter(|v| !v.is_empty()),
            notes: None,
            created_at: now,
            updated_at: now,
        };
        state.papers.push(model.clone());
        Ok(model)
    }

    async fn next_section_order(&self, paper_id: i64) -> Result<i32> {
        let state = lock(&self.state);
        Ok(state
            .sections
            .iter()
            .filter(|s| s.paper_id == paper_id)
            .map(|s| s.order)
            .max()
            .map_or(0, |max| max + 1))
    }

    async fn find_section_by_header_and_text(
        &self,
        paper_id: i64,
        header: &str,
        text: &str,
    ) -> Result<Option<Section>> {
        Ok(lock(&self.state)
            .sections
            .iter()
            .find(|s| s.paper_id == paper_id && s.header == header && s.text == text)
            .cloned())
    }

    async fn find_section_by_order(&self, paper_id: i64, order: i32) -> Result<Option<Section>> {
        Ok(lock(&self.state)
            .sections
            .iter()
            .find(|s| s.paper_id == paper_id && s.order == order)
            .cloned())
    }

    async fn create_section(
        &self,
        paper_id: i64,
        header: &str,
        text: &str,
        order: i32,
    ) -> Result<Section> {
        if paper_id <= 0 || text.is_empty() {
            return Err(AppError::Validation {
                message: "section requires a paper id and text".into(),
                field: Some("text".into()),
            });
        }
        if lock(&self.fail_section_text).as_deref() == Some(text) {
            return Err(AppError::DatabaseConnection {
                message: "injected section insert failure".into(),
            });
        }

        let now = chrono::Utc::now().naive_utc();
        let mut state = lock(&self.state);
        state.next_section_id += 1;
        let section = Section {
            id: state.next_section_id,
            paper_id,
            order,
            header: header.to_string(),
            text: text.to_string(),
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        state.sections.push(section.clone());
        Ok(section)
    }

    async fn save_log(&self, entry: NewLogEntry) -> Result<()> {
        if self.fail_logs.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: "injected log failure".into(),
            });
        }
        lock(&self.state).logs.push(entry);
        Ok(())
    }
}
