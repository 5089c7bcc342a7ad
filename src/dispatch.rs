//! The dispatch loop: claims ready messages, resolves attachments,
//! composes and sends them, and records the outcome.
//!
//! A `tokio::time::interval` tick driving the loop, an `Arc<AtomicBool>`
//! running flag checked each iteration, and per-tick summary logging.

use crate::cache::AttachmentCache;
use crate::error::RelayResult;
use crate::rate_limiter::RateLimiter;
use crate::smtp::classifier::{classify, Outcome, RetrySchedule};
use crate::smtp::compose::compose;
use crate::smtp::SmtpConnectionPool;
use crate::storage::{AccountQuotaMap, StorageAdapter};
use crate::types::{Account, FetchMode, Message};
use crate::attachments::AttachmentResolver;
use chrono::Utc;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Per-tick counters, logged at `info!` in lieu of a metrics exporter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchTickSummary {
    pub claimed: usize,
    pub sent: usize,
    pub deferred: usize,
    pub permanently_failed: usize,
}

pub struct DispatchLoop {
    storage: Arc<dyn StorageAdapter>,
    smtp_pool: Arc<SmtpConnectionPool>,
    attachments: Arc<AttachmentResolver>,
    _cache: Arc<AttachmentCache>,
    retry_schedule: RetrySchedule,
    batch_size: usize,
    global_concurrency: Arc<Semaphore>,
    per_account_concurrency: usize,
    running: Arc<AtomicBool>,
    rng: Mutex<StdRng>,
}

impl DispatchLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        smtp_pool: Arc<SmtpConnectionPool>,
        attachments: Arc<AttachmentResolver>,
        cache: Arc<AttachmentCache>,
        retry_schedule: RetrySchedule,
        batch_size: usize,
        global_concurrency: usize,
        per_account_concurrency: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            storage,
            smtp_pool,
            attachments,
            _cache: cache,
            retry_schedule,
            batch_size,
            global_concurrency: Arc::new(Semaphore::new(global_concurrency.max(1))),
            per_account_concurrency,
            running,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Runs ticks until `running` flips to false. Each tick claims a batch,
    /// groups it by account (to respect per-account concurrency), and
    /// dispatches every message concurrently within that cap.
    pub async fn run(&self, tick_interval: std::time::Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            match self.tick().await {
                Ok(summary) => info!(
                    claimed = summary.claimed,
                    sent = summary.sent,
                    deferred = summary.deferred,
                    permanently_failed = summary.permanently_failed,
                    "dispatch tick complete"
                ),
                Err(e) => warn!(error = %e, category = e.category(), "dispatch tick failed"),
            }
        }
    }

    pub async fn tick(&self) -> RelayResult<DispatchTickSummary> {
        let accounts = self.storage.list_accounts().await?;
        let now = Utc::now();

        let mut quota_map = AccountQuotaMap::new();
        let mut accounts_by_id = HashMap::new();
        for account in accounts {
            let limiter = RateLimiter::new(self.storage.as_ref());
            let remaining = limiter.remaining_quota(&account, now).await?;
            if remaining > 0 {
                quota_map.insert(account.id.clone(), remaining.min(self.batch_size as u32));
            }
            accounts_by_id.insert(account.id.clone(), account);
        }

        let claimed = self.storage.claim_ready(now, &quota_map, self.batch_size).await?;
        debug!(count = claimed.len(), "claimed messages for dispatch");

        let mut by_account: HashMap<String, Vec<Message>> = HashMap::new();
        for message in claimed {
            by_account.entry(message.account_id.clone()).or_default().push(message);
        }

        let mut summary = DispatchTickSummary { claimed: 0, sent: 0, deferred: 0, permanently_failed: 0 };

        let per_account_futures = by_account.into_iter().map(|(account_id, messages)| {
            let account = accounts_by_id.get(&account_id).cloned();
            self.dispatch_account_batch(account, messages)
        });

        for partial in join_all(per_account_futures).await {
            summary.claimed += partial.claimed;
            summary.sent += partial.sent;
            summary.deferred += partial.deferred;
            summary.permanently_failed += partial.permanently_failed;
        }

        Ok(summary)
    }

    async fn dispatch_account_batch(&self, account: Option<Account>, messages: Vec<Message>) -> DispatchTickSummary {
        let mut summary = DispatchTickSummary { claimed: messages.len(), ..Default::default() };

        let Some(account) = account else {
            warn!("dropping batch for unknown account");
            return summary;
        };

        let account_semaphore = Arc::new(Semaphore::new(self.per_account_concurrency.max(1)));
        let global = self.global_concurrency.clone();

        let futures = messages.into_iter().map(|message| {
            let account = account.clone();
            let account_semaphore = account_semaphore.clone();
            let global = global.clone();
            async move {
                let _global_permit = global.acquire().await.ok()?;
                let _account_permit = account_semaphore.acquire().await.ok()?;
                Some(self.dispatch_one(&account, message).await)
            }
        });

        for result in join_all(futures).await.into_iter().flatten() {
            match result {
                DispatchResult::Sent => summary.sent += 1,
                DispatchResult::Deferred => summary.deferred += 1,
                DispatchResult::PermanentlyFailed => summary.permanently_failed += 1,
            }
        }

        summary
    }

    async fn dispatch_one(&self, account: &Account, message: Message) -> DispatchResult {
        let needs_tenant = message.payload.attachments.iter().any(|a| a.fetch_mode == FetchMode::Endpoint);
        let tenant = if needs_tenant {
            match &message.tenant_id {
                Some(tenant_id) => self.storage.get_tenant(tenant_id).await.ok().flatten(),
                None => None,
            }
        } else {
            None
        };

        let mut resolved = Vec::with_capacity(message.payload.attachments.len());
        for descriptor in &message.payload.attachments {
            match self.attachments.resolve(descriptor, tenant.as_ref()).await {
                Ok(attachment) => resolved.push(attachment),
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "attachment resolve failed");
                    return self.record_failure(&message, &e.to_string(), false).await;
                }
            }
        }

        let lettre_message = match compose(&message, &resolved) {
            Ok(m) => m,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "compose failed");
                return self.record_failure(&message, &e.to_string(), true).await;
            }
        };

        let lease = match self.smtp_pool.acquire(account).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "smtp acquire failed");
                return self.record_failure(&message, &e.to_string(), false).await;
            }
        };

        let send_result = lease.send(&lettre_message).await;

        match &send_result {
            Ok(_) => lease.release().await,
            Err(_) => {}
        }

        match send_result {
            Ok(_) => {
                let now = Utc::now();
                if let Err(e) = self.storage.mark_sent(&message.id, message.tenant_id.as_deref(), now).await {
                    warn!(message_id = %message.id, error = %e, "mark_sent failed");
                }
                let _ = self
                    .storage
                    .append_send_log(crate::types::SendLogEntry { account_id: account.id.clone(), ts: now })
                    .await;
                DispatchResult::Sent
            }
            Err(e) => {
                let permanent = matches!(classify(None, Some(&e)), Outcome::PermanentFailure);
                self.record_failure(&message, &e.to_string(), permanent).await
            }
        }
    }

    async fn record_failure(&self, message: &Message, error_text: &str, permanent: bool) -> DispatchResult {
        let now = Utc::now();

        if permanent {
            let _ = self
                .storage
                .mark_error(&message.id, message.tenant_id.as_deref(), now, error_text, None, message.retry_count)
                .await;
            return DispatchResult::PermanentlyFailed;
        }

        let mut rng = self.rng.lock().await;
        let delay = self.retry_schedule.delay_for(message.retry_count, &mut *rng);
        drop(rng);

        match delay {
            Some(delay) => {
                let next = now + delay;
                let _ = self
                    .storage
                    .mark_error(
                        &message.id,
                        message.tenant_id.as_deref(),
                        now,
                        error_text,
                        Some(next),
                        message.retry_count + 1,
                    )
                    .await;
                DispatchResult::Deferred
            }
            None => {
                let _ = self
                    .storage
                    .mark_error(&message.id, message.tenant_id.as_deref(), now, error_text, None, message.retry_count)
                    .await;
                DispatchResult::PermanentlyFailed
            }
        }
    }

}

enum DispatchResult {
    Sent,
    Deferred,
    PermanentlyFailed,
}
