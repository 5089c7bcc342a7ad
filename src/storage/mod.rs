//! Storage adapter: durable persistence of messages, accounts, tenants,
//! send-log and config.
//!
//! sqlx-backed, migrations run as plain `CREATE TABLE IF NOT EXISTS`
//! statements, expressed as a capability trait so the embedded
//! single-file implementation (`sqlite`) and the networked relational one
//! (`postgres`) share a single contract.

pub mod postgres;
pub mod sqlite;

use crate::error::RelayResult;
use crate::types::{Account, Message, RejectedMessage, SendLogEntry, Tenant};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Outcome of `insert_messages`.
#[derive(Debug, Default)]
pub struct InsertOutcome {
    pub accepted_ids: Vec<String>,
    pub rejected: Vec<RejectedMessage>,
}

/// Per-account remaining quota as computed by the rate limiter, consulted by
/// `claim_ready`. A missing entry means the account is not
/// eligible this tick at all.
pub type AccountQuotaMap = HashMap<String, u32>;

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn insert_messages(&self, batch: Vec<Message>) -> RelayResult<InsertOutcome>;

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        account_quota_map: &AccountQuotaMap,
        limit: usize,
    ) -> RelayResult<Vec<Message>>;

    async fn mark_sent(&self, id: &str, tenant_id: Option<&str>, ts: DateTime<Utc>) -> RelayResult<()>;

    #[allow(clippy::too_many_arguments)]
    async fn mark_error(
        &self,
        id: &str,
        tenant_id: Option<&str>,
        ts: DateTime<Utc>,
        error_text: &str,
        next_deferred_ts: Option<DateTime<Utc>>,
        new_retry_count: u32,
    ) -> RelayResult<()>;

    async fn list_terminal_unreported(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> RelayResult<Vec<Message>>;

    async fn mark_reported(&self, ids: &[(String, Option<String>)], ts: DateTime<Utc>) -> RelayResult<()>;

    /// Deletes reported messages older than `ts`, scoped to `tenant_id`
    /// when given (`None` matches messages with no tenant association) so
    /// callers can apply a distinct cutoff per tenant retention override.
    async fn delete_reported_before(&self, tenant_id: Option<&str>, ts: DateTime<Utc>) -> RelayResult<u64>;

    async fn delete_send_log_before(&self, ts: DateTime<Utc>) -> RelayResult<u64>;

    async fn append_send_log(&self, entry: SendLogEntry) -> RelayResult<()>;

    async fn count_send_log_since(&self, account_id: &str, since_ts: DateTime<Utc>) -> RelayResult<i64>;

    async fn oldest_send_log_since(&self, account_id: &str, since_ts: DateTime<Utc>) -> RelayResult<Option<DateTime<Utc>>>;

    async fn upsert_account(&self, account: Account) -> RelayResult<()>;
    async fn list_accounts(&self) -> RelayResult<Vec<Account>>;
    async fn get_account(&self, id: &str) -> RelayResult<Option<Account>>;
    async fn delete_account(&self, id: &str) -> RelayResult<()>;

    async fn upsert_tenant(&self, tenant: Tenant) -> RelayResult<()>;
    async fn list_tenants(&self) -> RelayResult<Vec<Tenant>>;
    async fn get_tenant(&self, id: &str) -> RelayResult<Option<Tenant>>;
    async fn delete_tenant(&self, id: &str) -> RelayResult<()>;

    async fn list_messages(&self, tenant_id: Option<&str>, active_only: bool) -> RelayResult<Vec<Message>>;
    async fn delete_messages(&self, tenant_id: Option<&str>, ids: &[String]) -> RelayResult<(u64, u64)>;
}
