use sea_orm::entity::prelude::*;

/// Key/value settings reread on demand (per-group quota thresholds live
/// here under `quota_threshold:<group>`).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "settings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub value: String,
}

impl ActiveModelBehavior for ActiveModel {}
