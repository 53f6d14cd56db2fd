use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "device_authorizations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub device_code: String,
    pub user_code: String, // canonical XXXX-XXXX
    pub client_id: String,
    pub client_name: Option<String>,
    pub scope: String, // space separated, request order preserved
    pub client_auth_method: String,
    pub device_info: Option<String>, // JSON: {ip_address, user_agent}
    pub status: String, // "pending" | "approved" | "denied" | "expired" | "redeemed"
    pub created_at: i64,
    pub expires_at: i64,
    pub last_poll_at: Option<i64>,
    pub poll_interval: i64,
    pub approved_subject: Option<String>,
    pub auth_time: Option<i64>,
    pub redeemed_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
