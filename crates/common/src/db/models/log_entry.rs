//! User-facing processing log entry

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub level: String,

    #[sea_orm(column_type = "Text")]
    pub user_message: String,

    #[sea_orm(column_type = "Text")]
    pub full_log: String,

    /// Pipeline stage that produced the entry
    pub stage: String,

    pub user_id: i64,

    pub screen_id: i64,

    pub created_at: DateTime,

    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
