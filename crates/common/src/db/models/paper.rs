//! Paper entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "papers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Random public identifier
    pub slug: String,

    #[sea_orm(nullable)]
    pub custom_key: Option<String>,

    #[sea_orm(nullable)]
    pub issn: Option<String>,

    #[sea_orm(nullable)]
    pub doi: Option<String>,

    pub user_id: i64,

    pub screen_id: i64,

    #[sea_orm(nullable)]
    pub pubmed_id: Option<i64>,

    #[sea_orm(column_type = "Text")]
    pub title: String,

    #[sea_orm(column_name = "abstract", column_type = "Text")]
    pub abstract_text: String,

    #[sea_orm(nullable)]
    pub journal: Option<String>,

    #[sea_orm(nullable)]
    pub year: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub notes: Option<String>,

    pub created_at: DateTime,

    pub updated_at: DateTime,
}

impl Model {
    /// DOI if present and non-empty
    pub fn doi(&self) -> Option<&str> {
        self.doi.as_deref().filter(|d| !d.is_empty())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::section::Entity")]
    Sections,
}

impl Related<super::section::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sections.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
