//! Retention sweeping: attempt/request logs keep 24 h, persisted
//! signatures keep their TTL.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use agpool_common::now_ms;
use agpool_storage::SqliteStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const LOG_RETENTION: time::Duration = time::Duration::hours(24);

pub async fn run_sweeper(
    store: Arc<SqliteStore>,
    signature_ttl_ms: u64,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            _ = cancel.cancelled() => return,
        }
        let cutoff = OffsetDateTime::now_utc() - LOG_RETENTION;
        match store.sweep_logs_before(cutoff).await {
            Ok(0) => {}
            Ok(count) => tracing::debug!(count, "swept log rows"),
            Err(err) => tracing::warn!(error = %err, "log sweep failed"),
        }
        if let Err(err) = store
            .sweep_signatures_before(now_ms() - signature_ttl_ms as i64)
            .await
        {
            tracing::warn!(error = %err, "signature sweep failed");
        }
    }
}
