//! Crossref REST API client
//!
//! - `GET /works/{doi}` for a DOI lookup
//! - `GET /works?query.bibliographic=...&rows=1` for a title search
//!
//! Requests share a token bucket so the pool stays inside Crossref's
//! polite-pool limits, and 429/5xx responses are retried with backoff.

use super::{create_rate_limiter, ApiRateLimiter, BibliographicLookup, EnrichedMetadata};
use crate::extraction::tei::{squash_whitespace, strip_markup};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use paperintake_common::config::EnrichmentConfig;
use paperintake_common::{AppError, Result};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

const RETRY_INITIAL_INTERVAL: Duration = Duration::from_millis(500);

pub struct CrossrefClient {
    client: Client,
    base_url: Url,
    mailto: Option<String>,
    limiter: Arc<ApiRateLimiter>,
    max_retry: Duration,
}

impl CrossrefClient {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let base_url = Url::parse(&config.crossref_url).map_err(|e| AppError::Configuration {
            message: format!("Invalid Crossref URL {}: {}", config.crossref_url, e),
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url,
            mailto: config.mailto.clone().filter(|m| !m.is_empty()),
            limiter: Arc::new(create_rate_limiter(config.requests_per_second)),
            max_retry: Duration::from_secs(config.max_retry_secs),
        })
    }

    fn works_url(&self) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Configuration {
                message: format!("Crossref URL {} cannot be a base", self.base_url),
            })?
            .pop_if_empty()
            .push("works");
        Ok(url)
    }

    fn with_mailto(&self, url: &mut Url) {
        if let Some(ref mailto) = self.mailto {
            url.query_pairs_mut().append_pair("mailto", mailto);
        }
    }

    /// GET a JSON document; `Ok(None)` on 404
    async fn get_json<T: DeserializeOwned + Send>(&self, url: Url) -> Result<Option<T>> {
        let policy = ExponentialBackoff {
            initial_interval: RETRY_INITIAL_INTERVAL,
            max_elapsed_time: Some(self.max_retry),
            ..Default::default()
        };
        let client = &self.client;
        let limiter = &self.limiter;

        retry(policy, || {
            let url = url.clone();
            async move {
                limiter.until_ready().await;

                let response = client.get(url).send().await.map_err(|e| {
                    let err = AppError::from(e);
                    if err.is_connectivity() {
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })?;

                let status = response.status();
                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                    debug!(status = %status, "Crossref asked us to back off");
                    return Err(backoff::Error::transient(AppError::EnrichmentError {
                        message: format!("Crossref returned {}", status),
                    }));
                }
                if !status.is_success() {
                    return Err(backoff::Error::permanent(AppError::EnrichmentError {
                        message: format!("Crossref returned {}", status),
                    }));
                }

                response
                    .json::<T>()
                    .await
                    .map(Some)
                    .map_err(|e| backoff::Error::permanent(AppError::from(e)))
            }
        })
        .await
    }
}

#[async_trait]
impl BibliographicLookup for CrossrefClient {
    #[instrument(skip(self))]
    async fn by_doi(&self, doi: &str) -> Result<Option<EnrichedMetadata>> {
        let mut url = self.works_url()?;
        url.path_segments_mut()
            .map_err(|_| AppError::Internal {
                message: "works URL cannot be a base".into(),
            })?
            .push(doi);
        self.with_mailto(&mut url);

        let envelope: Option<Envelope<Work>> = self.get_json(url).await?;
        Ok(envelope.map(|e| e.message.into_metadata()))
    }

    #[instrument(skip(self))]
    async fn by_title(&self, title: &str) -> Result<Option<EnrichedMetadata>> {
        let mut url = self.works_url()?;
        url.query_pairs_mut()
            .append_pair("query.bibliographic", title)
            .append_pair("rows", "1");
        self.with_mailto(&mut url);

        let envelope: Option<Envelope<WorkList>> = self.get_json(url).await?;
        let best = envelope.and_then(|e| e.message.items.into_iter().next());

        // A bibliographic query always returns its closest hit; only an
        // exact title match counts as the same paper
        Ok(best
            .map(Work::into_metadata)
            .filter(|m| same_title(&m.title, title)))
    }

    fn name(&self) -> &'static str {
        "crossref"
    }
}

/// Case, punctuation and spacing-insensitive title comparison
pub fn same_title(a: &str, b: &str) -> bool {
    let comparable = |s: &str| {
        s.chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { ' ' })
            .collect::<String>()
    };
    let (a, b) = (squash_whitespace(&comparable(a)), squash_whitespace(&comparable(b)));
    !a.is_empty() && a == b
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    message: T,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WorkList {
    items: Vec<Work>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Work {
    #[serde(rename = "DOI")]
    doi: String,
    title: Vec<String>,
    #[serde(rename = "abstract")]
    abstract_text: Option<String>,
    #[serde(rename = "ISSN")]
    issn: Vec<String>,
    issued: Option<PartialDate>,
    #[serde(rename = "published-print")]
    published_print: Option<PartialDate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialDate {
    #[serde(rename = "date-parts")]
    date_parts: Vec<Vec<Option<i64>>>,
}

impl PartialDate {
    fn year(&self) -> Option<i64> {
        self.date_parts.first()?.first().copied().flatten()
    }
}

impl Work {
    fn into_metadata(self) -> EnrichedMetadata {
        let year = self
            .issued
            .as_ref()
            .and_then(PartialDate::year)
            .or_else(|| self.published_print.as_ref().and_then(PartialDate::year))
            .map(|y| y.to_string())
            .unwrap_or_default();

        EnrichedMetadata {
            title: self
                .title
                .first()
                .map(|t| squash_whitespace(t))
                .unwrap_or_default(),
            year,
            abstract_text: self
                .abstract_text
                .as_deref()
                .map(strip_markup)
                .unwrap_or_default(),
            doi: self.doi.trim().to_string(),
            issn: self.issn.into_iter().next().unwrap_or_default(),
        }
    }
}
