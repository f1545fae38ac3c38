//! PaperIntake Ingestion Service
//!
//! Turns uploaded scholarly PDFs into Paper and Section rows:
//! - `dispatcher` long-polls the request queue into a bounded channel
//! - `pool` runs the workers, paced by the `rate_governor`
//! - `processor` runs the per-job pipeline and failure handling
//! - `extraction`, `enrichment`, `document` and `resolver` are the pipeline stages
//! - `health` gates worker start-up on the extraction service
//! - `supervisor` ties them together around one cancellation token

pub mod dispatcher;
pub mod document;
pub mod enrichment;
pub mod errors;
pub mod extraction;
pub mod health;
pub mod job;
pub mod pool;
pub mod processor;
pub mod rate_governor;
pub mod resolver;
pub mod supervisor;

pub use errors::{IngestError, Stage};
pub use job::Job;
pub use processor::{Collaborators, Outcome, Processor, ProcessorSettings};
pub use supervisor::{Service, ServiceError, ServiceSettings};
