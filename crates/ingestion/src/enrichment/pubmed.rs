//! PubMed E-utilities client (esearch by DOI)

use super::{create_rate_limiter, ApiRateLimiter, ExternalIdLookup};
use async_trait::async_trait;
use paperintake_common::config::EnrichmentConfig;
use paperintake_common::{AppError, Result};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

pub struct PubMedClient {
    client: Client,
    search_url: Url,
    limiter: ApiRateLimiter,
}

impl PubMedClient {
    pub fn new(config: &EnrichmentConfig) -> Result<Self> {
        let search_url = Url::parse(&format!(
            "{}/esearch.fcgi",
            config.pubmed_url.trim_end_matches('/')
        ))
        .map_err(|e| AppError::Configuration {
            message: format!("Invalid PubMed URL {}: {}", config.pubmed_url, e),
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            search_url,
            limiter: create_rate_limiter(config.requests_per_second),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResponse {
    esearchresult: SearchResult,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchResult {
    idlist: Vec<String>,
}

#[async_trait]
impl ExternalIdLookup for PubMedClient {
    #[instrument(skip(self))]
    async fn pubmed_id(&self, doi: &str) -> Result<Option<i64>> {
        let mut url = self.search_url.clone();
        url.query_pairs_mut()
            .append_pair("db", "pubmed")
            .append_pair("term", doi)
            .append_pair("retmode", "json");

        self.limiter.until_ready().await;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::EnrichmentError {
                message: format!("PubMed returned {}", response.status()),
            });
        }

        let body: SearchResponse = response.json().await?;
        let Some(first) = body.esearchresult.idlist.into_iter().next() else {
            debug!("No PubMed record for DOI");
            return Ok(None);
        };

        first
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| AppError::EnrichmentError {
                message: format!("PubMed returned non-numeric id {:?}: {}", first, e),
            })
    }
}
