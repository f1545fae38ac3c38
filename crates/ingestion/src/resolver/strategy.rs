//! Paper identity strategies
//!
//! A document with a DOI is identified by `(screen, DOI)` alone. Title keys
//! only identify documents that have no DOI.

use crate::document::DocumentRecord;
use paperintake_common::db::models::Paper;
use paperintake_common::{PaperStore, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// `(screen, DOI)`
    Doi,
    /// `(screen, title, abstract)`
    TitleAndAbstract,
    /// `(screen, title)`
    Title,
}

impl Strategy {
    /// Keys for a document without a DOI, in order; the first hit wins
    pub const FALLBACKS: [Strategy; 2] = [Strategy::TitleAndAbstract, Strategy::Title];

    /// Keys that identify `record`
    pub fn candidates(record: &DocumentRecord) -> &'static [Strategy] {
        if record.doi.is_empty() {
            &Self::FALLBACKS
        } else {
            &[Strategy::Doi]
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Doi => "doi",
            Strategy::TitleAndAbstract => "title_abstract",
            Strategy::Title => "title",
        }
    }

    /// Whether the record carries the fields this strategy keys on
    pub fn applies_to(&self, record: &DocumentRecord) -> bool {
        match self {
            Strategy::Doi => !record.doi.is_empty(),
            Strategy::TitleAndAbstract => {
                !record.title.is_empty() && !record.abstract_text.is_empty()
            }
            Strategy::Title => !record.title.is_empty(),
        }
    }

    pub async fn find(
        &self,
        store: &dyn PaperStore,
        screen_id: i64,
        record: &DocumentRecord,
    ) -> Result<Option<Paper>> {
        match self {
            Strategy::Doi => store.find_paper_by_doi(screen_id, &record.doi).await,
            Strategy::TitleAndAbstract => {
                store
                    .find_paper_by_title_and_abstract(screen_id, &record.title, &record.abstract_text)
                    .await
            }
            Strategy::Title => store.find_paper_by_title(screen_id, &record.title).await,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
