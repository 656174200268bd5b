use sea_orm::sea_query::{Expr, Index, OnConflict};
use sea_orm::{
    ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Statement,
    TransactionTrait,
};
use time::OffsetDateTime;

use crate::entities;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("account not found: {0}")]
    AccountNotFound(i64),
}

pub type AccountRow = entities::accounts::Model;

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_ERROR: &str = "error";
pub const STATUS_DISABLED: &str = "disabled";

#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub email: Option<String>,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub instance_id: Option<String>,
    pub device_fingerprint: Option<String>,
    pub session_id: Option<String>,
}

/// Row returned by the hot-path selection query: account columns plus the
/// quota that applies to the selection key.
#[derive(Debug, Clone, FromQueryResult)]
pub struct CandidateRow {
    pub id: i64,
    pub email: Option<String>,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub token_expires_at: Option<i64>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub instance_id: Option<String>,
    pub device_fingerprint: Option<String>,
    pub session_id: Option<String>,
    pub status: String,
    pub sel_quota_remaining: f64,
    pub sel_quota_reset_time: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct AttemptInsert {
    pub request_id: String,
    pub account_id: Option<i64>,
    pub model: String,
    pub attempt_no: i32,
    pub account_attempt: i32,
    pub same_retry: i32,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
    pub started_at: i64,
}

#[derive(Clone)]
pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    pub async fn connect(db_path: &str) -> StorageResult<Self> {
        let dsn = if db_path.starts_with("sqlite:") {
            db_path.to_string()
        } else {
            format!("sqlite://{db_path}?mode=rwc")
        };
        let db = Database::connect(&dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA journal_mode = WAL").await?;
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
            db.execute_unprepared("PRAGMA busy_timeout = 5000").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync (additive), plus the indexes the hot path
    /// relies on and the one legacy table rebuild.
    pub async fn sync(&self) -> StorageResult<()> {
        sea_orm::Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Accounts)
            .register(entities::AccountModelQuotas)
            .register(entities::RequestLogs)
            .register(entities::RequestAttemptLogs)
            .register(entities::ApiKeys)
            .register(entities::Settings)
            .register(entities::SignatureCache)
            .sync(&self.db)
            .await?;
        self.ensure_indexes().await?;
        self.rebuild_accounts_if_email_not_null().await?;
        Ok(())
    }

    async fn ensure_indexes(&self) -> StorageResult<()> {
        use entities::account_model_quotas::Column as QuotaColumn;
        use entities::request_attempt_logs::Column as AttemptColumn;

        let statements = vec![
            Index::create()
                .name("idx_account_model_quotas_account_model")
                .table(entities::account_model_quotas::Entity)
                .col(QuotaColumn::AccountId)
                .col(QuotaColumn::Model)
                .unique()
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_attempt_logs_request")
                .table(entities::request_attempt_logs::Entity)
                .col(AttemptColumn::RequestId)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_request_attempt_logs_created")
                .table(entities::request_attempt_logs::Entity)
                .col(AttemptColumn::CreatedAt)
                .if_not_exists()
                .to_owned(),
        ];
        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }

    /// Databases written by old versions carried NOT NULL on accounts.email.
    /// Sqlite cannot drop the constraint in place, so the table is rebuilt
    /// inside a transaction with foreign keys off.
    async fn rebuild_accounts_if_email_not_null(&self) -> StorageResult<()> {
        let rows = self
            .db
            .query_all(&Statement::from_string(
                DatabaseBackend::Sqlite,
                "PRAGMA table_info(accounts)".to_string(),
            ))
            .await?;
        let mut email_not_null = false;
        for row in &rows {
            let name: String = row.try_get("", "name").unwrap_or_default();
            if name == "email" {
                let notnull: i32 = row.try_get("", "notnull").unwrap_or(0);
                email_not_null = notnull != 0;
            }
        }
        if !email_not_null {
            return Ok(());
        }

        tracing::info!("rebuilding accounts table to drop legacy NOT NULL on email");
        self.db.execute_unprepared("PRAGMA foreign_keys = OFF").await?;
        let result = self
            .db
            .execute_unprepared(
                r#"
BEGIN;
CREATE TABLE accounts_rebuild (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT NULL UNIQUE,
    refresh_token TEXT NOT NULL,
    access_token TEXT NULL,
    token_expires_at INTEGER NULL,
    project_id TEXT NULL,
    tier TEXT NULL,
    instance_id TEXT NULL,
    device_fingerprint TEXT NULL,
    session_id TEXT NULL,
    status TEXT NOT NULL,
    error_count INTEGER NOT NULL,
    last_error TEXT NULL,
    last_used_at INTEGER NULL,
    quota_remaining REAL NOT NULL,
    quota_reset_time INTEGER NULL,
    created_at TEXT NOT NULL
);
INSERT INTO accounts_rebuild SELECT
    id, email, refresh_token, access_token, token_expires_at, project_id,
    tier, instance_id, device_fingerprint, session_id, status, error_count,
    last_error, last_used_at, quota_remaining, quota_reset_time, created_at
FROM accounts;
DROP TABLE accounts;
ALTER TABLE accounts_rebuild RENAME TO accounts;
COMMIT;
"#,
            )
            .await;
        self.db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        result?;
        Ok(())
    }

    // ── accounts ──

    pub async fn insert_account(&self, new: NewAccount) -> StorageResult<AccountRow> {
        let active = entities::accounts::ActiveModel {
            email: ActiveValue::Set(new.email),
            refresh_token: ActiveValue::Set(new.refresh_token),
            access_token: ActiveValue::Set(new.access_token),
            token_expires_at: ActiveValue::Set(new.token_expires_at),
            project_id: ActiveValue::Set(new.project_id),
            tier: ActiveValue::Set(new.tier),
            instance_id: ActiveValue::Set(new.instance_id),
            device_fingerprint: ActiveValue::Set(new.device_fingerprint),
            session_id: ActiveValue::Set(new.session_id),
            status: ActiveValue::Set(STATUS_ACTIVE.to_string()),
            error_count: ActiveValue::Set(0),
            last_error: ActiveValue::Set(None),
            last_used_at: ActiveValue::Set(None),
            quota_remaining: ActiveValue::Set(1.0),
            quota_reset_time: ActiveValue::Set(None),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        let inserted = entities::Accounts::insert(active)
            .exec_with_returning(&self.db)
            .await?;
        Ok(inserted)
    }

    pub async fn get_account(&self, id: i64) -> StorageResult<AccountRow> {
        entities::Accounts::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or(StorageError::AccountNotFound(id))
    }

    pub async fn list_accounts(&self) -> StorageResult<Vec<AccountRow>> {
        Ok(entities::Accounts::find()
            .order_by_asc(entities::accounts::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn update_account_tokens(
        &self,
        id: i64,
        access_token: &str,
        token_expires_at: i64,
    ) -> StorageResult<()> {
        entities::Accounts::update_many()
            .col_expr(
                entities::accounts::Column::AccessToken,
                Expr::value(access_token),
            )
            .col_expr(
                entities::accounts::Column::TokenExpiresAt,
                Expr::value(token_expires_at),
            )
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn update_account_identity(
        &self,
        id: i64,
        email: Option<&str>,
        tier: Option<&str>,
        project_id: Option<&str>,
    ) -> StorageResult<()> {
        let mut update = entities::Accounts::update_many();
        if let Some(email) = email {
            update = update.col_expr(entities::accounts::Column::Email, Expr::value(email));
        }
        if let Some(tier) = tier {
            update = update.col_expr(entities::accounts::Column::Tier, Expr::value(tier));
        }
        if let Some(project_id) = project_id {
            update = update.col_expr(
                entities::accounts::Column::ProjectId,
                Expr::value(project_id),
            );
        }
        update
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_account_status(
        &self,
        id: i64,
        status: &str,
        last_error: Option<&str>,
    ) -> StorageResult<()> {
        let mut update = entities::Accounts::update_many()
            .col_expr(entities::accounts::Column::Status, Expr::value(status));
        if let Some(last_error) = last_error {
            update = update.col_expr(
                entities::accounts::Column::LastError,
                Expr::value(last_error),
            );
        }
        update
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_account_error_count(&self, id: i64, count: i32) -> StorageResult<()> {
        entities::Accounts::update_many()
            .col_expr(entities::accounts::Column::ErrorCount, Expr::value(count))
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn touch_account_used(&self, id: i64, now_ms: i64) -> StorageResult<()> {
        entities::Accounts::update_many()
            .col_expr(entities::accounts::Column::LastUsedAt, Expr::value(now_ms))
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn set_aggregate_quota(
        &self,
        id: i64,
        quota_remaining: f64,
        quota_reset_time: Option<i64>,
    ) -> StorageResult<()> {
        entities::Accounts::update_many()
            .col_expr(
                entities::accounts::Column::QuotaRemaining,
                Expr::value(quota_remaining.clamp(0.0, 1.0)),
            )
            .col_expr(
                entities::accounts::Column::QuotaResetTime,
                Expr::value(quota_reset_time),
            )
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Delete an account: attempt-log rows keep their history with a nulled
    /// account id, per-model quota rows go with the account.
    pub async fn delete_account(&self, id: i64) -> StorageResult<()> {
        let txn = self.db.begin().await?;
        entities::RequestAttemptLogs::update_many()
            .col_expr(
                entities::request_attempt_logs::Column::AccountId,
                Expr::value(Option::<i64>::None),
            )
            .filter(entities::request_attempt_logs::Column::AccountId.eq(id))
            .exec(&txn)
            .await?;
        entities::AccountModelQuotas::delete_many()
            .filter(entities::account_model_quotas::Column::AccountId.eq(id))
            .exec(&txn)
            .await?;
        entities::Accounts::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }

    // ── selection ──

    /// Hot-path candidate query.
    ///
    /// Group keys (`group_join = true`) require a quota row for the group's
    /// representative model: accounts without one are excluded rather than
    /// treated as full. Raw-model keys fall back to the aggregate quota.
    /// Ordered by quota descending, then least-recently-used.
    pub async fn active_accounts(
        &self,
        join_model: &str,
        group_join: bool,
        min_quota: f64,
    ) -> StorageResult<Vec<CandidateRow>> {
        let sql = if group_join {
            r#"
SELECT a.id, a.email, a.refresh_token, a.access_token, a.token_expires_at,
       a.project_id, a.tier, a.instance_id, a.device_fingerprint, a.session_id,
       a.status,
       q.quota_remaining AS sel_quota_remaining,
       q.quota_reset_time AS sel_quota_reset_time
FROM accounts a
JOIN account_model_quotas q ON q.account_id = a.id AND q.model = ?
WHERE a.status = 'active' AND q.quota_remaining >= ?
ORDER BY q.quota_remaining DESC, COALESCE(a.last_used_at, 0) ASC
"#
        } else {
            r#"
SELECT a.id, a.email, a.refresh_token, a.access_token, a.token_expires_at,
       a.project_id, a.tier, a.instance_id, a.device_fingerprint, a.session_id,
       a.status,
       COALESCE(q.quota_remaining, a.quota_remaining) AS sel_quota_remaining,
       COALESCE(q.quota_reset_time, a.quota_reset_time) AS sel_quota_reset_time
FROM accounts a
LEFT JOIN account_model_quotas q ON q.account_id = a.id AND q.model = ?
WHERE a.status = 'active' AND COALESCE(q.quota_remaining, a.quota_remaining) >= ?
ORDER BY sel_quota_remaining DESC, COALESCE(a.last_used_at, 0) ASC
"#
        };
        let rows = CandidateRow::find_by_statement(Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            sql,
            [join_model.into(), min_quota.into()],
        ))
        .all(&self.db)
        .await?;
        Ok(rows)
    }

    // ── per-model quotas ──

    pub async fn upsert_model_quota(
        &self,
        account_id: i64,
        model: &str,
        quota_remaining: f64,
        quota_reset_time: Option<i64>,
    ) -> StorageResult<()> {
        let active = entities::account_model_quotas::ActiveModel {
            account_id: ActiveValue::Set(account_id),
            model: ActiveValue::Set(model.to_string()),
            quota_remaining: ActiveValue::Set(quota_remaining.clamp(0.0, 1.0)),
            quota_reset_time: ActiveValue::Set(quota_reset_time),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::AccountModelQuotas::insert(active)
            .on_conflict(
                OnConflict::columns([
                    entities::account_model_quotas::Column::AccountId,
                    entities::account_model_quotas::Column::Model,
                ])
                .update_columns([
                    entities::account_model_quotas::Column::QuotaRemaining,
                    entities::account_model_quotas::Column::QuotaResetTime,
                    entities::account_model_quotas::Column::UpdatedAt,
                ])
                .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn model_quotas(
        &self,
        account_id: i64,
    ) -> StorageResult<Vec<entities::account_model_quotas::Model>> {
        Ok(entities::AccountModelQuotas::find()
            .filter(entities::account_model_quotas::Column::AccountId.eq(account_id))
            .order_by_asc(entities::account_model_quotas::Column::Model)
            .all(&self.db)
            .await?)
    }

    // ── attempt + request logs ──

    pub async fn insert_attempt(&self, attempt: AttemptInsert) -> StorageResult<()> {
        let active = entities::request_attempt_logs::ActiveModel {
            request_id: ActiveValue::Set(attempt.request_id),
            account_id: ActiveValue::Set(attempt.account_id),
            model: ActiveValue::Set(attempt.model),
            attempt_no: ActiveValue::Set(attempt.attempt_no),
            account_attempt: ActiveValue::Set(attempt.account_attempt),
            same_retry: ActiveValue::Set(attempt.same_retry),
            status: ActiveValue::Set(attempt.status),
            latency_ms: ActiveValue::Set(attempt.latency_ms),
            error_message: ActiveValue::Set(attempt.error_message),
            started_at: ActiveValue::Set(attempt.started_at),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::RequestAttemptLogs::insert(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn attempts_for_request(
        &self,
        request_id: &str,
    ) -> StorageResult<Vec<entities::request_attempt_logs::Model>> {
        Ok(entities::RequestAttemptLogs::find()
            .filter(entities::request_attempt_logs::Column::RequestId.eq(request_id))
            .order_by_asc(entities::request_attempt_logs::Column::Id)
            .all(&self.db)
            .await?)
    }

    pub async fn recent_attempts(
        &self,
        limit: u64,
    ) -> StorageResult<Vec<entities::request_attempt_logs::Model>> {
        Ok(entities::RequestAttemptLogs::find()
            .order_by_desc(entities::request_attempt_logs::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn insert_request_log(
        &self,
        request_id: &str,
        dialect: &str,
        model: &str,
        status: &str,
        latency_ms: Option<i64>,
    ) -> StorageResult<()> {
        let active = entities::request_logs::ActiveModel {
            request_id: ActiveValue::Set(request_id.to_string()),
            dialect: ActiveValue::Set(dialect.to_string()),
            model: ActiveValue::Set(model.to_string()),
            status: ActiveValue::Set(status.to_string()),
            latency_ms: ActiveValue::Set(latency_ms),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        entities::RequestLogs::insert(active).exec(&self.db).await?;
        Ok(())
    }

    /// 24 h retention for both log tables.
    pub async fn sweep_logs_before(&self, cutoff: OffsetDateTime) -> StorageResult<u64> {
        let attempts = entities::RequestAttemptLogs::delete_many()
            .filter(entities::request_attempt_logs::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        let requests = entities::RequestLogs::delete_many()
            .filter(entities::request_logs::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(attempts.rows_affected + requests.rows_affected)
    }

    // ── api keys ──

    pub async fn add_api_key(&self, key_hash: &str, label: Option<&str>) -> StorageResult<i64> {
        let active = entities::api_keys::ActiveModel {
            key_hash: ActiveValue::Set(key_hash.to_string()),
            label: ActiveValue::Set(label.map(|l| l.to_string())),
            enabled: ActiveValue::Set(true),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        let result = entities::ApiKeys::insert(active).exec(&self.db).await?;
        Ok(result.last_insert_id)
    }

    pub async fn delete_api_key(&self, id: i64) -> StorageResult<()> {
        entities::ApiKeys::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    pub async fn list_api_keys(&self) -> StorageResult<Vec<entities::api_keys::Model>> {
        Ok(entities::ApiKeys::find().all(&self.db).await?)
    }

    pub async fn enabled_key_hashes(&self) -> StorageResult<Vec<String>> {
        Ok(entities::ApiKeys::find()
            .filter(entities::api_keys::Column::Enabled.eq(true))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| row.key_hash)
            .collect())
    }

    // ── settings ──

    pub async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(entities::Settings::find_by_id(key.to_string())
            .one(&self.db)
            .await?
            .map(|row| row.value))
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        let active = entities::settings::ActiveModel {
            key: ActiveValue::Set(key.to_string()),
            value: ActiveValue::Set(value.to_string()),
        };
        entities::Settings::insert(active)
            .on_conflict(
                OnConflict::column(entities::settings::Column::Key)
                    .update_column(entities::settings::Column::Value)
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn all_settings(&self) -> StorageResult<Vec<entities::settings::Model>> {
        Ok(entities::Settings::find().all(&self.db).await?)
    }

    // ── signature cache ──

    pub async fn load_signatures(&self) -> StorageResult<Vec<entities::signature_cache::Model>> {
        Ok(entities::SignatureCache::find().all(&self.db).await?)
    }

    pub async fn put_signature(
        &self,
        key: &str,
        signature: &str,
        thought_text: Option<&str>,
        saved_at: i64,
    ) -> StorageResult<()> {
        let active = entities::signature_cache::ActiveModel {
            key: ActiveValue::Set(key.to_string()),
            signature: ActiveValue::Set(signature.to_string()),
            thought_text: ActiveValue::Set(thought_text.map(|t| t.to_string())),
            saved_at: ActiveValue::Set(saved_at),
        };
        entities::SignatureCache::insert(active)
            .on_conflict(
                OnConflict::column(entities::signature_cache::Column::Key)
                    .update_columns([
                        entities::signature_cache::Column::Signature,
                        entities::signature_cache::Column::ThoughtText,
                        entities::signature_cache::Column::SavedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn sweep_signatures_before(&self, saved_before_ms: i64) -> StorageResult<u64> {
        let result = entities::SignatureCache::delete_many()
            .filter(entities::signature_cache::Column::SavedAt.lt(saved_before_ms))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

/// sha256 hex of a downstream key, the only form persisted.
pub fn hash_api_key(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
