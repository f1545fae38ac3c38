//! Ingestion service error types
//!
//! Every pipeline failure falls in one of three classes:
//! - `Malformed`: the message can never succeed and is dropped
//! - `Retryable`: goes through the failure handler, tagged with its stage
//! - `SourceMissing`: the uploaded file is gone; settled once, never retried
//! - `DependencyDown`: the extraction service is unreachable; the service stops

use std::fmt;
use thiserror::Error;

/// Pipeline stage that produced an error, written into the log table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Fetch,
    Extraction,
    Parsing,
    Resolution,
    Persistence,
    Accounting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Fetch => "fetch",
            Stage::Extraction => "extraction",
            Stage::Parsing => "parsing",
            Stage::Resolution => "resolution",
            Stage::Persistence => "persistence",
            Stage::Accounting => "accounting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed job: {0}")]
    Malformed(String),

    #[error("Extraction service unreachable: {0}")]
    DependencyDown(String),

    #[error("{stage} failed: {message}")]
    Retryable { stage: Stage, message: String },

    #[error("Source file missing: {0}")]
    SourceMissing(String),
}

impl IngestError {
    /// Wrap any displayable error as retryable at `stage`
    pub fn retryable(stage: Stage, err: impl fmt::Display) -> Self {
        IngestError::Retryable {
            stage,
            message: err.to_string(),
        }
    }

    /// Stage tag for the log table
    pub fn stage(&self) -> Stage {
        match self {
            IngestError::Malformed(_) => Stage::Decode,
            IngestError::DependencyDown(_) => Stage::Extraction,
            IngestError::Retryable { stage, .. } => *stage,
            IngestError::SourceMissing(_) => Stage::Fetch,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, IngestError::DependencyDown(_))
    }

    /// Re-publishing cannot help
    pub fn is_source_missing(&self) -> bool {
        matches!(self, IngestError::SourceMissing(_))
    }
}
