use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Per-account, per-model quota snapshot. A missing row means "unknown" and
/// is treated as empty by group selection so stale accounts never look full.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "account_model_quotas")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub account_id: i64,
    pub model: String,
    pub quota_remaining: f64,
    pub quota_reset_time: Option<i64>,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "account_id", to = "id", on_delete = "Cascade")]
    pub account: HasOne<super::accounts::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
