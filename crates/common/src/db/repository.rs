//! Repository pattern for database operations
//!
//! MySQL-backed implementation of [`PaperStore`]. Lookups go to the read
//! connection, inserts to the primary.

use crate::db::models::*;
use crate::db::{DbPool, NewLogEntry, NewPaper, PaperStore};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use rand::{distributions::Alphanumeric, Rng};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    QueryFilter, QueryOrder, Set, Statement,
};
use tracing::{debug, info, warn};

/// Length of the random public slug given to every paper
pub const SLUG_LENGTH: usize = 14;

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    // ========================================================================
    // Health Check
    // ========================================================================

    /// Ping the database
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    /// Return the first match and note when the screen holds several
    fn first_of(papers: Vec<Paper>, lookup: &str, screen_id: i64) -> Option<Paper> {
        if papers.len() > 1 {
            let ids: Vec<i64> = papers.iter().map(|p| p.id).collect();
            info!(screen_id, lookup, paper_ids = ?ids, "Multiple papers matched, using the oldest");
        }
        papers.into_iter().next()
    }
}

/// Random alphanumeric slug
pub fn generate_slug() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SLUG_LENGTH)
        .map(char::from)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}


#[async_trait]
impl PaperStore for Repository {
    // ========================================================================
    // Paper Operations
    // ========================================================================

    async fn find_paper_by_doi(&self, screen_id: i64, doi: &str) -> Result<Option<Paper>> {
        PaperEntity::find()
            .filter(PaperColumn::ScreenId.eq(screen_id))
            .filter(PaperColumn::Doi.eq(doi))
            .order_by_asc(PaperColumn::Id)
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn find_paper_by_title_and_abstract(
        &self,
        screen_id: i64,
        title: &str,
        abstract_text: &str,
    ) -> Result<Option<Paper>> {
        let papers = PaperEntity::find()
            .filter(PaperColumn::ScreenId.eq(screen_id))
            .filter(PaperColumn::Title.eq(title))
            .filter(PaperColumn::AbstractText.eq(abstract_text))
            .order_by_asc(PaperColumn::Id)
            .all(self.read_conn())
            .await?;

        Ok(Self::first_of(papers, "title_and_abstract", screen_id))
    }

    async fn find_paper_by_title(&self, screen_id: i64, title: &str) -> Result<Option<Paper>> {
        let papers = PaperEntity::find()
            .filter(PaperColumn::ScreenId.eq(screen_id))
            .filter(PaperColumn::Title.eq(title))
            .order_by_asc(PaperColumn::Id)
            .all(self.read_conn())
            .await?;

        Ok(Self::first_of(papers, "title", screen_id))
    }

    async fn create_paper(&self, paper: NewPaper) -> Result<Paper> {
        paper.validate()?;

        if paper.title.is_empty() || paper.abstract_text.is_empty() {
            warn!(
                user_id = paper.user_id,
                screen_id = paper.screen_id,
                title = %paper.title,
                "Creating paper with empty title or abstract"
            );
        }

        let now = chrono::Utc::now().naive_utc();

        let model = PaperActiveModel {
            slug: Set(generate_slug()),
            custom_key: Set(None),
            issn: Set(non_empty(paper.issn)),
            doi: Set(non_empty(paper.doi)),
            user_id: Set(paper.user_id),
            screen_id: Set(paper.screen_id),
            pubmed_id: Set(paper.pubmed_id),
            title: Set(paper.title),
            abstract_text: Set(paper.abstract_text),
            journal: Set(None),
            year: Set(non_empty(paper.year)),
            notes: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        model.insert(self.write_conn()).await.map_err(Into::into)
    }

    // ========================================================================
    // Section Operations
    // ========================================================================

    async fn next_section_order(&self, paper_id: i64) -> Result<i32> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::MySql,
            "SELECT COALESCE(MAX(`order`), -1) + 1 AS next_order FROM sections WHERE paper_id = ?",
            [paper_id.into()],
        );

        let row = self
            .read_conn()
            .query_one(stmt)
            .await?
            .ok_or_else(|| AppError::Internal {
                message: format!("next order query returned no row for paper {}", paper_id),
            })?;

        let next: i64 = row.try_get("", "next_order")?;
        i32::try_from(next).map_err(|_| AppError::Internal {
            message: format!("section order overflow for paper {}", paper_id),
        })
    }

    async fn find_section_by_header_and_text(
        &self,
        paper_id: i64,
        header: &str,
        text: &str,
    ) -> Result<Option<Section>> {
        SectionEntity::find()
            .filter(SectionColumn::PaperId.eq(paper_id))
            .filter(SectionColumn::Header.eq(header))
            .filter(SectionColumn::Text.eq(text))
            .one(self.read_conn())
            .await
            .map_err(Into::into)
    }

    async fn find_section_by_order(&self, paper_id: i64, order: i32) -> Result<Option<Section>> {
        // Positional checks race with inserts, so they read from the primary
        SectionEntity::find()
            .filter(SectionColumn::PaperId.eq(paper_id))
            .filter(SectionColumn::Order.eq(order))
            .one(self.write_conn())
            .await
            .map_err(Into::into)
    }

    async fn create_section(
        &self,
        paper_id: i64,
        header: &str,
        text: &str,
        order: i32,
    ) -> Result<Section> {
        if paper_id <= 0 || text.is_empty() {
            return Err(AppError::Validation {
                message: format!("section requires a paper id and text (paper_id={})", paper_id),
                field: Some(if paper_id <= 0 { "paper_id" } else { "text" }.into()),
            });
        }
        if header.is_empty() {
            warn!(paper_id, order, "Creating section with empty header");
        }

        let now = chrono::Utc::now().naive_utc();
        let model = SectionActiveModel {
            paper_id: Set(paper_id),
            order: Set(order),
            header: Set(header.to_string()),
            text: Set(text.to_string()),
            embedding: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        let section = model.insert(self.write_conn()).await?;
        debug!(paper_id, order, section_id = section.id, "Section created");
        Ok(section)
    }

    // ========================================================================
    // Log Operations
    // ========================================================================

    async fn save_log(&self, entry: NewLogEntry) -> Result<()> {
        let now = chrono::Utc::now().naive_utc();
        let model = LogEntryActiveModel {
            level: Set(entry.level),
            user_message: Set(entry.user_message),
            full_log: Set(entry.full_log),
            stage: Set(entry.stage),
            user_id: Set(entry.user_id),
            screen_id: Set(entry.screen_id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        model.insert(self.write_conn()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_shape() {
        let slug = generate_slug();
        assert_eq!(slug.len(), SLUG_LENGTH);
        assert!(slug.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(slug, generate_slug());
    }

    #[test]
    fn test_non_empty_drops_blank() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(Some("10.1/x".into())), Some("10.1/x".into()));
    }
}
