//! Section entity: one paragraph of a paper under its heading

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sections")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub paper_id: i64,

    /// Dense, ascending position within the paper
    pub order: i32,

    #[sea_orm(column_type = "Text")]
    pub header: String,

    #[sea_orm(column_type = "Text")]
    pub text: String,

    /// Filled later by the screening service
    #[sea_orm(column_type = "Text", nullable)]
    pub embedding: Option<String>,

    pub created_at: DateTime,

    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::paper::Entity",
        from = "Column::PaperId",
        to = "super::paper::Column::Id"
    )]
    Paper,
}

impl Related<super::paper::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Paper.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
