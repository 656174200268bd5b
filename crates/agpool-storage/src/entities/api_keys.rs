use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    /// sha256 hex of the downstream key; plaintext is never stored.
    #[sea_orm(unique)]
    pub key_hash: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
