//! Full-text extraction
//!
//! - `ExtractionService`: the contract the pipeline calls (GROBID in production)
//! - `grobid`: HTTP client for the GROBID REST API
//! - `tei`: streaming reader for the TEI XML GROBID returns

pub mod grobid;
pub mod tei;

pub use grobid::GrobidClient;
pub use tei::{TeiDocument, TeiIdentifier, TeiSection};

use crate::errors::{IngestError, Stage};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    /// Transport-level failure reaching the service
    #[error("extraction service unreachable: {0}")]
    Unavailable(String),

    /// The service answered but did not produce a document
    #[error("extraction failed: {0}")]
    Failed(String),

    #[error("invalid TEI document: {0}")]
    InvalidDocument(String),
}

impl From<ExtractionError> for IngestError {
    fn from(err: ExtractionError) -> Self {
        match err {
            ExtractionError::Unavailable(message) => IngestError::DependencyDown(message),
            ExtractionError::Failed(_) => IngestError::retryable(Stage::Extraction, err),
            ExtractionError::InvalidDocument(_) => IngestError::retryable(Stage::Parsing, err),
        }
    }
}

/// PDF to TEI conversion service
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Convert PDF bytes into TEI XML
    async fn process_fulltext(&self, pdf: Vec<u8>) -> Result<String, ExtractionError>;

    /// Liveness probe; any transport error counts as not alive
    async fn is_alive(&self) -> bool;
}
