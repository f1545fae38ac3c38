//! Database layer for PaperIntake
//!
//! Provides:
//! - SeaORM entity models for papers, sections and log entries
//! - The `PaperStore` contract consumed by the ingestion pipeline
//! - A MySQL-backed `Repository` implementing it
//! - Connection pool management

pub mod models;
mod repository;

pub use repository::{generate_slug, Repository, SLUG_LENGTH};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use models::{Paper, Section};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    /// Primary connection (for writes)
    pub primary: DatabaseConnection,

    /// Read replica connection (optional)
    pub replica: Option<DatabaseConnection>,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to primary database...");

        let primary = Self::connect(&config.url, config)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect to primary: {}", e),
            })?;

        let replica = match config.read_url {
            Some(ref read_url) => {
                info!("Connecting to read replica...");
                let conn = Self::connect(read_url, config)
                    .await
                    .map_err(|e| AppError::DatabaseConnection {
                        message: format!("Failed to connect to replica: {}", e),
                    })?;
                Some(conn)
            }
            None => None,
        };

        info!("Database connections established");

        Ok(Self { primary, replica })
    }

    async fn connect(
        url: &str,
        config: &DatabaseConfig,
    ) -> std::result::Result<DatabaseConnection, sea_orm::DbErr> {
        let mut opts = ConnectOptions::new(url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        Database::connect(opts).await
    }

    /// Get the connection for reads (replica if available, otherwise primary)
    pub fn read(&self) -> &DatabaseConnection {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Get the connection for writes (always primary)
    pub fn write(&self) -> &DatabaseConnection {
        &self.primary
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        use sea_orm::ConnectionTrait;

        self.primary
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Primary ping failed: {}", e),
            })?;

        if let Some(ref replica) = self.replica {
            replica
                .execute_unprepared("SELECT 1")
                .await
                .map_err(|e| AppError::DatabaseConnection {
                    message: format!("Replica ping failed: {}", e),
                })?;
        }

        Ok(())
    }
}

/// Fields for a paper about to be inserted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPaper {
    pub user_id: i64,
    pub screen_id: i64,
    pub title: String,
    pub abstract_text: String,
    pub doi: Option<String>,
    pub issn: Option<String>,
    pub year: Option<String>,
    pub pubmed_id: Option<i64>,
}

impl NewPaper {
    /// Check the creation preconditions: non-zero ids and a title or a DOI
    pub fn validate(&self) -> Result<()> {
        if self.user_id <= 0 || self.screen_id <= 0 {
            return Err(AppError::Validation {
                message: format!(
                    "paper requires user and screen ids (user_id={}, screen_id={})",
                    self.user_id, self.screen_id
                ),
                field: Some(if self.user_id <= 0 { "user_id" } else { "screen_id" }.into()),
            });
        }
        let has_doi = self.doi.as_deref().is_some_and(|d| !d.is_empty());
        if self.title.trim().is_empty() && !has_doi {
            return Err(AppError::Validation {
                message: "paper requires a title or a DOI".into(),
                field: Some("title".into()),
            });
        }
        Ok(())
    }
}

/// Structured failure record written for the user's screen
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewLogEntry {
    pub level: String,
    pub user_message: String,
    pub full_log: String,
    pub stage: String,
    pub user_id: i64,
    pub screen_id: i64,
}

/// Relational operations the ingestion pipeline depends on
#[async_trait]
pub trait PaperStore: Send + Sync {
    /// Find a paper in a screen by exact DOI
    async fn find_paper_by_doi(&self, screen_id: i64, doi: &str) -> Result<Option<Paper>>;

    /// Find a paper in a screen by exact title and abstract
    async fn find_paper_by_title_and_abstract(
        &self,
        screen_id: i64,
        title: &str,
        abstract_text: &str,
    ) -> Result<Option<Paper>>;

    /// Find a paper in a screen by exact title
    async fn find_paper_by_title(&self, screen_id: i64, title: &str) -> Result<Option<Paper>>;

    /// Insert a paper; fails validation without a title/DOI or ids
    async fn create_paper(&self, paper: NewPaper) -> Result<Paper>;

    /// `max(order) + 1` for the paper, or 0 when it has no sections
    async fn next_section_order(&self, paper_id: i64) -> Result<i32>;

    async fn find_section_by_header_and_text(
        &self,
        paper_id: i64,
        header: &str,
        text: &str,
    ) -> Result<Option<Section>>;

    async fn find_section_by_order(&self, paper_id: i64, order: i32) -> Result<Option<Section>>;

    /// Insert a section at the given order
    async fn create_section(
        &self,
        paper_id: i64,
        header: &str,
        text: &str,
        order: i32,
    ) -> Result<Section>;

    async fn save_log(&self, entry: NewLogEntry) -> Result<()>;
}
