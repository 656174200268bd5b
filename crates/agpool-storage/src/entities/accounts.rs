use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One pooled upstream credential. Timestamps that the selection and token
/// paths compare against "now" are stored as epoch milliseconds; audit
/// columns use full timestamps.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub email: Option<String>,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    /// Synthetic hostname presented to the upstream.
    pub instance_id: Option<String>,
    pub device_fingerprint: Option<String>,
    /// Negative 64-bit integer rendered as a string.
    pub session_id: Option<String>,
    pub status: String,
    pub error_count: i32,
    pub last_error: Option<String>,
    pub last_used_at: Option<i64>,
    /// Aggregate fraction in [0,1]; minimum across relevant non-image models.
    pub quota_remaining: f64,
    pub quota_reset_time: Option<i64>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
