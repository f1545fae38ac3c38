//! Bibliographic enrichment
//!
//! Best-effort lookups that correct or complete extracted metadata:
//! - `crossref`: title/year/abstract/DOI/ISSN by DOI or by title
//! - `pubmed`: PubMed identifier by DOI
//!
//! Nothing in here fails a job. Lookup errors are logged and the pipeline
//! continues with whatever the extraction produced.

pub mod crossref;
pub mod pubmed;

pub use crossref::CrossrefClient;
pub use pubmed::PubMedClient;

use async_trait::async_trait;
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use paperintake_common::metrics;
use paperintake_common::Result;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, warn};

/// Request budget shared by every call to one external API
pub type ApiRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

pub fn create_rate_limiter(requests_per_second: u32) -> ApiRateLimiter {
    let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rate))
}

/// Metadata returned by a bibliographic lookup. Empty strings mean unknown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedMetadata {
    pub title: String,
    pub year: String,
    pub abstract_text: String,
    pub doi: String,
    pub issn: String,
}

/// Lookup of bibliographic records
#[async_trait]
pub trait BibliographicLookup: Send + Sync {
    /// `Ok(None)` when the DOI is unknown
    async fn by_doi(&self, doi: &str) -> Result<Option<EnrichedMetadata>>;

    /// `Ok(None)` when nothing matches the title
    async fn by_title(&self, title: &str) -> Result<Option<EnrichedMetadata>>;

    fn name(&self) -> &'static str;
}

/// Lookup of external identifiers keyed by DOI
#[async_trait]
pub trait ExternalIdLookup: Send + Sync {
    async fn pubmed_id(&self, doi: &str) -> Result<Option<i64>>;
}

/// Runs the lookups the pipeline asks for and swallows their failures
#[derive(Clone, Default)]
pub struct Enricher {
    bibliographic: Option<Arc<dyn BibliographicLookup>>,
    identifiers: Option<Arc<dyn ExternalIdLookup>>,
}

impl Enricher {
    pub fn new(
        bibliographic: Option<Arc<dyn BibliographicLookup>>,
        identifiers: Option<Arc<dyn ExternalIdLookup>>,
    ) -> Self {
        Self {
            bibliographic,
            identifiers,
        }
    }

    /// Enricher that never looks anything up
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Look up by DOI first; fall back to the title when that yields no DOI
    pub async fn lookup(&self, doi: &str, title: &str) -> Option<EnrichedMetadata> {
        let source = self.bibliographic.as_ref()?;

        let mut by_doi = None;
        if !doi.is_empty() {
            by_doi = record(source.name(), source.by_doi(doi).await, "doi", doi);
            if by_doi.as_ref().is_some_and(|m| !m.doi.is_empty()) {
                return by_doi;
            }
        }

        if !title.is_empty() {
            if let Some(found) = record(source.name(), source.by_title(title).await, "title", title)
            {
                return Some(found);
            }
        }

        by_doi
    }

    /// PubMed identifier for a DOI, if any
    pub async fn pubmed_id(&self, doi: &str) -> Option<i64> {
        let lookup = self.identifiers.as_ref()?;
        if doi.is_empty() {
            return None;
        }

        match lookup.pubmed_id(doi).await {
            Ok(id) => {
                metrics::record_enrichment("pubmed", true);
                id
            }
            Err(e) => {
                metrics::record_enrichment("pubmed", false);
                warn!(doi, error = %e, "PubMed lookup failed");
                None
            }
        }
    }
}

fn record(
    source: &str,
    result: Result<Option<EnrichedMetadata>>,
    by: &str,
    query: &str,
) -> Option<EnrichedMetadata> {
    match result {
        Ok(found) => {
            metrics::record_enrichment(source, true);
            debug!(source, by, query, found = found.is_some(), "Bibliographic lookup finished");
            found
        }
        Err(e) => {
            metrics::record_enrichment(source, false);
            warn!(source, by, query, error = %e, "Bibliographic lookup failed");
            None
        }
    }
}
