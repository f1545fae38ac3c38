//! Idempotent paper and section resolution
//!
//! - Papers are found by DOI when they have one, otherwise by the first
//!   matching title `Strategy`, or created
//! - Find-or-create for a screen runs under that screen's lock, so two
//!   uploads of the same paper cannot both miss and both insert
//! - Sections of a paper are written under the paper's lock with dense,
//!   ascending order; `(header, text)` duplicates are skipped

mod locks;
mod strategy;

pub use locks::KeyedLocks;
pub use strategy::Strategy;

use crate::document::{DocumentRecord, SectionDraft};
use crate::enrichment::Enricher;
use crate::errors::{IngestError, Stage};
use paperintake_common::db::models::Paper;
use paperintake_common::{metrics, PaperStore};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of `resolve_paper`
#[derive(Debug, Clone)]
pub struct ResolvedPaper {
    pub paper: Paper,
    pub created: bool,
    /// Matching strategy, `None` when the paper was created
    pub strategy: Option<Strategy>,
}

/// Section persistence tally for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionStats {
    pub inserted: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Resolver {
    store: Arc<dyn PaperStore>,
    enricher: Enricher,
    screen_locks: KeyedLocks<i64>,
    paper_locks: KeyedLocks<i64>,
}

impl Resolver {
    pub fn new(store: Arc<dyn PaperStore>, enricher: Enricher) -> Self {
        Self {
            store,
            enricher,
            screen_locks: KeyedLocks::new(),
            paper_locks: KeyedLocks::new(),
        }
    }

    /// First paper in the screen matching one of `strategies`
    async fn find(
        &self,
        strategies: &[Strategy],
        screen_id: i64,
        record: &DocumentRecord,
    ) -> paperintake_common::Result<Option<(Paper, Strategy)>> {
        for strategy in strategies {
            if !strategy.applies_to(record) {
                continue;
            }
            if let Some(paper) = strategy.find(self.store.as_ref(), screen_id, record).await? {
                return Ok(Some((paper, *strategy)));
            }
        }
        Ok(None)
    }

    /// Copy DOI and abstract from an earlier upload of the same document.
    ///
    /// Only runs when the record has no DOI. Lookup failures are logged and
    /// leave the record untouched.
    #[instrument(skip(self, record), fields(title = %record.title))]
    pub async fn backfill_from_screen(&self, screen_id: i64, record: &mut DocumentRecord) {
        if !record.doi.is_empty() {
            return;
        }

        match self.find(&Strategy::FALLBACKS, screen_id, record).await {
            Ok(Some((paper, strategy))) => {
                if record.backfill_from(&paper) {
                    info!(
                        paper_id = paper.id,
                        strategy = %strategy,
                        doi = %record.doi,
                        "Backfilled metadata from earlier upload"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Same-screen backfill lookup failed"),
        }
    }

    /// Find the paper for `record` or create it
    #[instrument(skip(self, record), fields(doi = %record.doi, title = %record.title))]
    pub async fn resolve_paper(
        &self,
        user_id: i64,
        screen_id: i64,
        record: &DocumentRecord,
    ) -> Result<ResolvedPaper, IngestError> {
        let resolution = |e| IngestError::retryable(Stage::Resolution, e);
        let keys = Strategy::candidates(record);

        if let Some(found) = self.find(keys, screen_id, record).await.map_err(resolution)? {
            return Ok(Self::matched(found));
        }

        // External id lookup happens outside the screen lock
        let pubmed_id = self.enricher.pubmed_id(&record.doi).await;

        let _guard = self.screen_locks.lock(screen_id).await;
        if let Some(found) = self.find(keys, screen_id, record).await.map_err(resolution)? {
            return Ok(Self::matched(found));
        }

        let new_paper = record.to_new_paper(user_id, screen_id, pubmed_id);
        match self.store.create_paper(new_paper).await {
            Ok(paper) => {
                info!(paper_id = paper.id, slug = %paper.slug, "Paper created");
                metrics::record_resolution("created");
                Ok(ResolvedPaper {
                    paper,
                    created: true,
                    strategy: None,
                })
            }
            Err(e) if e.is_duplicate() => {
                // Another process won the insert
                match self.find(keys, screen_id, record).await.map_err(resolution)? {
                    Some(found) => Ok(Self::matched(found)),
                    None => Err(resolution(e)),
                }
            }
            Err(e) => Err(resolution(e)),
        }
    }

    fn matched((paper, strategy): (Paper, Strategy)) -> ResolvedPaper {
        debug!(paper_id = paper.id, strategy = %strategy, "Paper already exists");
        metrics::record_resolution(strategy.as_str());
        ResolvedPaper {
            paper,
            created: false,
            strategy: Some(strategy),
        }
    }

    /// Insert `drafts` in order, skipping ones already stored.
    ///
    /// Order starts at 0 for a new paper and at `max(order) + 1` otherwise,
    /// and only advances on an actual insert. A failing section is logged and
    /// skipped.
    #[instrument(skip(self, resolved, drafts), fields(paper_id = resolved.paper.id, drafts = drafts.len()))]
    pub async fn persist_sections(
        &self,
        resolved: &ResolvedPaper,
        drafts: &[SectionDraft],
    ) -> Result<SectionStats, IngestError> {
        let paper_id = resolved.paper.id;
        let _guard = self.paper_locks.lock(paper_id).await;

        let mut order = if resolved.created {
            0
        } else {
            self.store
                .next_section_order(paper_id)
                .await
                .map_err(|e| IngestError::retryable(Stage::Persistence, e))?
        };

        let mut stats = SectionStats::default();
        for draft in drafts {
            match self
                .store
                .find_section_by_header_and_text(paper_id, &draft.header, &draft.text)
                .await
            {
                Ok(Some(_)) => {
                    stats.skipped += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(header = %draft.header, error = %e, "Section lookup failed, skipping");
                    stats.failed += 1;
                    continue;
                }
            }

            order = self.free_order(paper_id, order).await;

            match self
                .store
                .create_section(paper_id, &draft.header, &draft.text, order)
                .await
            {
                Ok(_) => {
                    stats.inserted += 1;
                    order += 1;
                }
                Err(e) if e.is_malformed() => {
                    debug!(header = %draft.header, error = %e, "Invalid section, skipping");
                    stats.failed += 1;
                }
                Err(e) => {
                    warn!(header = %draft.header, order, error = %e, "Section insert failed, skipping");
                    stats.failed += 1;
                }
            }
        }

        metrics::record_sections(stats.inserted, stats.skipped, stats.failed);
        debug!(
            inserted = stats.inserted,
            skipped = stats.skipped,
            failed = stats.failed,
            "Sections persisted"
        );
        Ok(stats)
    }

    /// First order at or after `order` not already taken by a writer outside
    /// this process
    async fn free_order(&self, paper_id: i64, mut order: i32) -> i32 {
        loop {
            match self.store.find_section_by_order(paper_id, order).await {
                Ok(Some(_)) => {
                    debug!(paper_id, order, "Order already taken");
                    order += 1;
                }
                Ok(None) => return order,
                Err(e) => {
                    warn!(paper_id, order, error = %e, "Positional check failed");
                    return order;
                }
            }
        }
    }
}
