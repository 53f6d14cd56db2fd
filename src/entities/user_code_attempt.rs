use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Failed user_code submissions for one client context (IP or session).
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "user_code_attempts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub context_key: String,
    pub failures: String, // JSON array of unix timestamps inside the window
    pub locked_until: Option<i64>,
    pub version: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
