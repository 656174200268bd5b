use sea_orm::entity::prelude::*;

/// Persisted tier of the thought-signature cache. The key is
/// `<kind>:<tool_call_id>`; entries expire by `saved_at` + TTL on read.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "signature_cache")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,
    pub signature: String,
    pub thought_text: Option<String>,
    pub saved_at: i64,
}

impl ActiveModelBehavior for ActiveModel {}
