use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One coarse row per inbound request. 24 h retention.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    /// Inbound dialect: openai | claude | gemini.
    pub dialect: String,
    pub model: String,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
