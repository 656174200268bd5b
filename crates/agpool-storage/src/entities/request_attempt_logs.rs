use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One row per upstream call, retries included. `account_id` is nulled when
/// the account is deleted; rows older than 24 h are swept.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_attempt_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub account_id: Option<i64>,
    pub model: String,
    /// 1-based index across all upstream calls for the request.
    pub attempt_no: i32,
    /// 1-based index of the account within the request (grows on switch).
    pub account_attempt: i32,
    /// 0-based count of same-account re-tries for this account.
    pub same_retry: i32,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: i64,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
