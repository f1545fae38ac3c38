//! PaperIntake Common Library
//!
//! Shared code for the PaperIntake services including:
//! - Database models and the paper repository
//! - Error types and handling
//! - Configuration management
//! - SQS queue and S3 blob store clients
//! - Redis outstanding-work counters
//! - Metrics and observability

pub mod cache;
pub mod config;
pub mod db;
pub mod errors;
pub mod metrics;
pub mod queue;
pub mod storage;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use cache::{Settlement, WorkCounter};
pub use config::AppConfig;
pub use db::{NewPaper, PaperStore, Repository};
pub use errors::{AppError, Result};
pub use queue::{MessageQueue, QueueMessage};
pub use storage::BlobStore;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Service name used in logs and the root endpoint
pub const SERVICE_NAME: &str = "paperintake-ingestion";
