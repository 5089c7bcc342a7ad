//! The cleanup loop: purges reported messages and stale send-log entries
//! past their retention window, and reaps idle SMTP connections.

use crate::error::RelayResult;
use crate::smtp::SmtpConnectionPool;
use crate::storage::StorageAdapter;
use chrono::{Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub struct CleanupLoop {
    storage: Arc<dyn StorageAdapter>,
    smtp_pool: Arc<SmtpConnectionPool>,
    default_retention: Duration,
    send_log_retention: Duration,
    running: Arc<AtomicBool>,
}

impl CleanupLoop {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        smtp_pool: Arc<SmtpConnectionPool>,
        default_retention: Duration,
        send_log_retention: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self { storage, smtp_pool, default_retention, send_log_retention, running }
    }

    pub async fn run(&self, tick_interval: std::time::Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            match self.tick().await {
                Ok((messages, log_rows)) => {
                    info!(messages_purged = messages, send_log_rows_purged = log_rows, "cleanup tick complete")
                }
                Err(e) => warn!(error = %e, category = e.category(), "cleanup tick failed"),
            }
        }
    }

    /// Returns `(messages_purged, send_log_rows_purged)`.
    pub async fn tick(&self) -> RelayResult<(u64, u64)> {
        let now = Utc::now();

        // Each tenant's own retention override applies only to its own
        // messages; tenants without an override, and messages with no
        // tenant association, fall back to the crate-wide default.
        let tenants = self.storage.list_tenants().await?;
        let mut messages_purged = 0u64;
        for tenant in &tenants {
            let retention = tenant.retention_override.unwrap_or(self.default_retention);
            messages_purged += self.storage.delete_reported_before(Some(&tenant.id), now - retention).await?;
        }
        messages_purged += self.storage.delete_reported_before(None, now - self.default_retention).await?;

        let log_rows_purged = self.storage.delete_send_log_before(now - self.send_log_retention).await?;

        self.smtp_pool.reap_idle().await;

        Ok((messages_purged, log_rows_purged))
    }
}
