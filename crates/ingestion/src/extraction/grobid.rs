//! GROBID REST client

use super::{ExtractionError, ExtractionService};
use async_trait::async_trait;
use paperintake_common::Result;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, instrument, warn};

const FULLTEXT_PATH: &str = "/api/processFulltextDocument";
const ALIVE_PATH: &str = "/api/isalive";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GrobidClient {
    client: Client,
    base_url: String,
}

impl GrobidClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Connection refused and name resolution failures surface as connect errors
fn classify(err: reqwest::Error) -> ExtractionError {
    if err.is_connect() {
        ExtractionError::Unavailable(err.to_string())
    } else {
        ExtractionError::Failed(err.to_string())
    }
}

#[async_trait]
impl ExtractionService for GrobidClient {
    #[instrument(skip(self, pdf), fields(bytes = pdf.len()))]
    async fn process_fulltext(&self, pdf: Vec<u8>) -> std::result::Result<String, ExtractionError> {
        let form = Form::new()
            .part(
                "input",
                Part::bytes(pdf)
                    .file_name("input.pdf")
                    .mime_str("application/pdf")
                    .map_err(|e| ExtractionError::Failed(e.to_string()))?,
            )
            .text("consolidateHeader", "1");

        let response = self
            .client
            .post(self.url(FULLTEXT_PATH))
            .multipart(form)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "GROBID rejected document");
            return Err(ExtractionError::Failed(format!(
                "GROBID returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let tei = response.text().await.map_err(classify)?;
        debug!(tei_bytes = tei.len(), "GROBID processed document");
        Ok(tei)
    }

    async fn is_alive(&self) -> bool {
        match self
            .client
            .get(self.url(ALIVE_PATH))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "GROBID probe failed");
                false
            }
        }
    }
}
