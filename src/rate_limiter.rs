//! Per-account sliding-window rate limiter.
//!
//! Reads the append-only send-log through the storage adapter rather than
//! keeping its own counters, so limiter state survives a restart without a
//! separate persistence path: the storage adapter is the single source of
//! truth, never an in-memory cache of counts.

use crate::error::RelayResult;
use crate::storage::StorageAdapter;
use crate::types::{Account, OverLimitPolicy, RateWindowLimits};
use chrono::{DateTime, Duration, Utc};

const MINUTE: i64 = 60;
const HOUR: i64 = 3_600;
const DAY: i64 = 86_400;

/// Outcome of an admission check for one send attempt against one account.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Send may proceed now.
    Admit,
    /// Send must wait; retry no earlier than this timestamp.
    Defer(DateTime<Utc>),
    /// The account's policy rejects sends while over limit (no retry).
    Reject,
}

pub struct RateLimiter<'a> {
    storage: &'a dyn StorageAdapter,
}

impl<'a> RateLimiter<'a> {
    pub fn new(storage: &'a dyn StorageAdapter) -> Self {
        Self { storage }
    }

    /// Checks whether `account` may send one more message right now.
    ///
    /// Evaluates the minute/hour/day windows independently and returns the
    /// tightest applicable outcome: the first window that rejects wins
    /// outright, otherwise the latest `retry_after` among deferring windows.
    pub async fn check(&self, account: &Account, now: DateTime<Utc>) -> RelayResult<Admission> {
        if account.limits.is_unbounded() {
            return Ok(Admission::Admit);
        }

        let mut defer_until: Option<DateTime<Utc>> = None;

        for (window_secs, limit) in windows(&account.limits) {
            let Some(limit) = limit else { continue };
            let since = now - Duration::seconds(window_secs);
            let count = self.storage.count_send_log_since(&account.id, since).await?;
            if (count as u32) < limit {
                continue;
            }

            if account.over_limit_policy == OverLimitPolicy::Reject {
                return Ok(Admission::Reject);
            }

            let oldest = self.storage.oldest_send_log_since(&account.id, since).await?;
            let retry_after = oldest
                .map(|t| t + Duration::seconds(window_secs) + Duration::seconds(1))
                .unwrap_or(now + Duration::seconds(window_secs));

            defer_until = Some(match defer_until {
                Some(existing) if existing >= retry_after => existing,
                _ => retry_after,
            });
        }

        Ok(defer_until.map(Admission::Defer).unwrap_or(Admission::Admit))
    }

    /// Computes the number of sends still available to `account` across all
    /// configured windows, for use as the `claim_ready` quota. `None` means
    /// unbounded.
    pub async fn remaining_quota(&self, account: &Account, now: DateTime<Utc>) -> RelayResult<u32> {
        if account.limits.is_unbounded() {
            return Ok(u32::MAX);
        }

        let mut tightest = u32::MAX;
        for (window_secs, limit) in windows(&account.limits) {
            let Some(limit) = limit else { continue };
            let since = now - Duration::seconds(window_secs);
            let count = self.storage.count_send_log_since(&account.id, since).await? as u32;
            tightest = tightest.min(limit.saturating_sub(count));
        }
        Ok(tightest)
    }
}

fn windows(limits: &RateWindowLimits) -> [(i64, Option<u32>); 3] {
    [(MINUTE, limits.per_minute), (HOUR, limits.per_hour), (DAY, limits.per_day)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::SqliteStorage;
    use crate::types::{SendLogEntry, TlsMode};

    fn account(limits: RateWindowLimits, policy: OverLimitPolicy) -> Account {
        Account {
            id: "A".to_string(),
            tenant_id: None,
            host: "smtp.example.com".to_string(),
            port: 587,
            tls_mode: TlsMode::Starttls,
            username: None,
            encrypted_password: None,
            limits,
            over_limit_policy: policy,
            batch_size_hint: None,
            connection_ttl_hint: None,
        }
    }

    #[tokio::test]
    async fn unbounded_account_always_admits() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let acct = account(RateWindowLimits::unbounded(), OverLimitPolicy::Defer);
        let limiter = RateLimiter::new(&storage);
        assert_eq!(limiter.check(&acct, Utc::now()).await.unwrap(), Admission::Admit);
    }

    #[tokio::test]
    async fn over_minute_limit_defers() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let now = Utc::now();
        for _ in 0..3 {
            storage.append_send_log(SendLogEntry { account_id: "A".to_string(), ts: now }).await.unwrap();
        }
        let limits = RateWindowLimits { per_minute: Some(3), per_hour: None, per_day: None };
        let acct = account(limits, OverLimitPolicy::Defer);
        let limiter = RateLimiter::new(&storage);
        match limiter.check(&acct, now).await.unwrap() {
            Admission::Defer(retry_after) => assert!(retry_after > now),
            other => panic!("expected Defer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn over_limit_with_reject_policy_rejects() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let now = Utc::now();
        storage.append_send_log(SendLogEntry { account_id: "A".to_string(), ts: now }).await.unwrap();
        let limits = RateWindowLimits { per_minute: Some(1), per_hour: None, per_day: None };
        let acct = account(limits, OverLimitPolicy::Reject);
        let limiter = RateLimiter::new(&storage);
        assert_eq!(limiter.check(&acct, now).await.unwrap(), Admission::Reject);
    }

    #[tokio::test]
    async fn stale_entries_outside_window_do_not_count() {
        let storage = SqliteStorage::connect("sqlite::memory:").await.unwrap();
        let now = Utc::now();
        storage
            .append_send_log(SendLogEntry { account_id: "A".to_string(), ts: now - Duration::seconds(120) })
            .await
            .unwrap();
        let limits = RateWindowLimits { per_minute: Some(1), per_hour: None, per_day: None };
        let acct = account(limits, OverLimitPolicy::Defer);
        let limiter = RateLimiter::new(&storage);
        assert_eq!(limiter.check(&acct, now).await.unwrap(), Admission::Admit);
    }
}
