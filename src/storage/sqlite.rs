//! Embedded single-file storage adapter backed by SQLite.
//!
//! A `sqlx` connection pool, migrations run as idempotent `CREATE TABLE
//! IF NOT EXISTS` statements in `run_migrations`, and one method per
//! entity operation. `claim_ready` additionally serializes through a
//! writer mutex, since SQLite has no `FOR UPDATE SKIP LOCKED`: the
//! selection must happen inside a single writer transaction on embedded
//! stores.

use crate::error::{RelayError, RelayResult};
use crate::storage::{AccountQuotaMap, InsertOutcome, StorageAdapter};
use crate::types::{
    Account, Message, MessagePayload, OverLimitPolicy, Priority, RateWindowLimits,
    RejectedMessage, SendLogEntry, Tenant, TlsMode,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::Mutex;

pub struct SqliteStorage {
    pool: SqlitePool,
    writer_lock: Mutex<()>,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> RelayResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        let storage = Self { pool, writer_lock: Mutex::new(()) };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                pk TEXT PRIMARY KEY,
                id TEXT NOT NULL,
                tenant_id TEXT,
                account_id TEXT NOT NULL,
                priority INTEGER NOT NULL,
                batch_code TEXT,
                deferred_ts INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                last_error TEXT,
                payload_json TEXT NOT NULL,
                created_ts INTEGER NOT NULL,
                sent_ts INTEGER,
                error_ts INTEGER,
                bounce_ts INTEGER,
                reported_ts INTEGER,
                UNIQUE(id, tenant_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_ready \
             ON messages (priority, deferred_ts, created_ts) \
             WHERE sent_ts IS NULL AND error_ts IS NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_unreported \
             ON messages (tenant_id, reported_ts)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS send_log (
                account_id TEXT NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_send_log ON send_log (account_id, ts DESC)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                tenant_id TEXT,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                tls_mode TEXT NOT NULL,
                username TEXT,
                encrypted_password TEXT,
                limit_per_minute INTEGER,
                limit_per_hour INTEGER,
                limit_per_day INTEGER,
                over_limit_policy TEXT NOT NULL,
                batch_size_hint INTEGER,
                connection_ttl_hint_secs INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenants (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                report_sink_base_url TEXT NOT NULL,
                report_sink_path TEXT NOT NULL,
                attachment_endpoint_base_url TEXT,
                attachment_endpoint_path TEXT,
                outbound_auth_json TEXT NOT NULL,
                active BOOLEAN NOT NULL,
                suspended_batches_json TEXT NOT NULL,
                retention_override_secs INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> RelayResult<Message> {
        let payload_json: String = row.try_get("payload_json")?;
        let payload: MessagePayload = serde_json::from_str(&payload_json)?;
        let priority = match row.try_get::<i64, _>("priority")? {
            0 => Priority::Immediate,
            1 => Priority::High,
            2 => Priority::Medium,
            _ => Priority::Low,
        };
        Ok(Message {
            id: row.try_get("id")?,
            pk: row.try_get::<String, _>("pk")?.parse().map_err(|_| RelayError::internal("bad pk"))?,
            tenant_id: row.try_get("tenant_id")?,
            account_id: row.try_get("account_id")?,
            priority,
            batch_code: row.try_get("batch_code")?,
            deferred_ts: ts_from_row(row, "deferred_ts")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            last_error: row.try_get("last_error")?,
            payload,
            created_ts: ts_from_row(row, "created_ts")?,
            sent_ts: opt_ts_from_row(row, "sent_ts")?,
            error_ts: opt_ts_from_row(row, "error_ts")?,
            bounce_ts: opt_ts_from_row(row, "bounce_ts")?,
            reported_ts: opt_ts_from_row(row, "reported_ts")?,
        })
    }

    fn row_to_tenant(row: &sqlx::sqlite::SqliteRow) -> RelayResult<Tenant> {
        let auth_json: String = row.try_get("outbound_auth_json")?;
        let suspended_json: String = row.try_get("suspended_batches_json")?;
        Ok(Tenant {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            report_sink_base_url: row.try_get("report_sink_base_url")?,
            report_sink_path: row.try_get("report_sink_path")?,
            attachment_endpoint_base_url: row.try_get("attachment_endpoint_base_url")?,
            attachment_endpoint_path: row.try_get("attachment_endpoint_path")?,
            outbound_auth: serde_json::from_str(&auth_json)?,
            active: row.try_get("active")?,
            suspended_batches: serde_json::from_str(&suspended_json)?,
            retention_override: row
                .try_get::<Option<i64>, _>("retention_override_secs")?
                .map(chrono::Duration::seconds),
        })
    }

    fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> RelayResult<Account> {
        let tls_mode = match row.try_get::<String, _>("tls_mode")?.as_str() {
            "implicit" => TlsMode::Implicit,
            "starttls" => TlsMode::Starttls,
            _ => TlsMode::None,
        };
        let over_limit_policy = match row.try_get::<String, _>("over_limit_policy")?.as_str() {
            "reject" => OverLimitPolicy::Reject,
            _ => OverLimitPolicy::Defer,
        };
        Ok(Account {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            host: row.try_get("host")?,
            port: row.try_get::<i64, _>("port")? as u16,
            tls_mode,
            username: row.try_get("username")?,
            encrypted_password: row
                .try_get::<Option<String>, _>("encrypted_password")?
                .map(secrecy::SecretString::new),
            limits: RateWindowLimits {
                per_minute: row.try_get::<Option<i64>, _>("limit_per_minute")?.map(|v| v as u32),
                per_hour: row.try_get::<Option<i64>, _>("limit_per_hour")?.map(|v| v as u32),
                per_day: row.try_get::<Option<i64>, _>("limit_per_day")?.map(|v| v as u32),
            },
            over_limit_policy,
            batch_size_hint: row.try_get::<Option<i64>, _>("batch_size_hint")?.map(|v| v as usize),
            connection_ttl_hint: row
                .try_get::<Option<i64>, _>("connection_ttl_hint_secs")?
                .map(chrono::Duration::seconds),
        })
    }
}

fn ts_from_row(row: &sqlx::sqlite::SqliteRow, col: &str) -> RelayResult<DateTime<Utc>> {
    let secs: i64 = row.try_get(col)?;
    Ok(DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now))
}

fn opt_ts_from_row(row: &sqlx::sqlite::SqliteRow, col: &str) -> RelayResult<Option<DateTime<Utc>>> {
    let secs: Option<i64> = row.try_get(col)?;
    Ok(secs.and_then(|s| DateTime::from_timestamp(s, 0)))
}

fn validate_payload(m: &Message) -> Option<String> {
    if m.id.trim().is_empty() {
        return Some("empty id".to_string());
    }
    if m.payload.from.trim().is_empty() {
        return Some("empty from".to_string());
    }
    if m.payload.subject.trim().is_empty() {
        return Some("empty subject".to_string());
    }
    if m.payload.body.trim().is_empty() {
        return Some("empty body".to_string());
    }
    if m.payload.to.is_empty() {
        return Some("empty recipient list".to_string());
    }
    if m.account_id.trim().is_empty() {
        return Some("missing account_id".to_string());
    }
    None
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn insert_messages(&self, batch: Vec<Message>) -> RelayResult<InsertOutcome> {
        let _guard = self.writer_lock.lock().await;
        let mut out = InsertOutcome::default();

        for m in batch {
            if let Some(reason) = validate_payload(&m) {
                out.rejected.push(RejectedMessage { id: m.id, reason });
                continue;
            }

            let exists: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM messages WHERE id = ? AND (tenant_id IS ? OR tenant_id = ?)",
            )
            .bind(&m.id)
            .bind(&m.tenant_id)
            .bind(&m.tenant_id)
            .fetch_optional(&self.pool)
            .await?;

            if exists.is_some() {
                out.rejected.push(RejectedMessage { id: m.id, reason: "duplicate".to_string() });
                continue;
            }

            let payload_json = serde_json::to_string(&m.payload)?;
            sqlx::query(
                r#"
                INSERT INTO messages
                    (pk, id, tenant_id, account_id, priority, batch_code, deferred_ts,
                     retry_count, last_error, payload_json, created_ts, sent_ts, error_ts,
                     bounce_ts, reported_ts)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL)
                "#,
            )
            .bind(m.pk.to_string())
            .bind(&m.id)
            .bind(&m.tenant_id)
            .bind(&m.account_id)
            .bind(m.priority as i64)
            .bind(&m.batch_code)
            .bind(m.deferred_ts.timestamp())
            .bind(m.retry_count as i64)
            .bind(&m.last_error)
            .bind(payload_json)
            .bind(m.created_ts.timestamp())
            .execute(&self.pool)
            .await?;

            out.accepted_ids.push(m.id);
        }

        Ok(out)
    }

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        account_quota_map: &AccountQuotaMap,
        limit: usize,
    ) -> RelayResult<Vec<Message>> {
        let _guard = self.writer_lock.lock().await;

        // Fetch a generous superset in the correct order, then apply
        // tenant-suspension and per-account-quota filtering in memory
        // (SQLite has no row-locking semantics to push this further down).
        let scan_limit = (limit * 8).max(limit + 64) as i64;
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE sent_ts IS NULL AND error_ts IS NULL AND deferred_ts <= ?
            ORDER BY priority ASC, deferred_ts ASC, created_ts ASC
            LIMIT ?
            "#,
        )
        .bind(now.timestamp())
        .bind(scan_limit)
        .fetch_all(&self.pool)
        .await?;

        let tenant_rows = sqlx::query("SELECT * FROM tenants").fetch_all(&self.pool).await?;
        let mut tenants: HashMap<String, Tenant> = HashMap::new();
        for row in &tenant_rows {
            let t = Self::row_to_tenant(row)?;
            tenants.insert(t.id.clone(), t);
        }

        let mut remaining_quota: HashMap<&str, u32> =
            account_quota_map.iter().map(|(k, v)| (k.as_str(), *v)).collect();

        let mut claimed = Vec::with_capacity(limit);
        for row in &rows {
            if claimed.len() >= limit {
                break;
            }
            let msg = Self::row_to_message(row)?;

            let quota = match remaining_quota.get(msg.account_id.as_str()) {
                Some(q) if *q > 0 => *q,
                _ => continue,
            };

            if let Some(tenant_id) = &msg.tenant_id {
                if let Some(tenant) = tenants.get(tenant_id) {
                    if !tenant.active {
                        continue;
                    }
                    if tenant.suspended_batches.suspends(msg.batch_code.as_deref()) {
                        continue;
                    }
                }
            }

            *remaining_quota.get_mut(msg.account_id.as_str()).unwrap() = quota - 1;
            claimed.push(msg);
        }

        Ok(claimed)
    }

    async fn mark_sent(&self, id: &str, tenant_id: Option<&str>, ts: DateTime<Utc>) -> RelayResult<()> {
        sqlx::query(
            "UPDATE messages SET sent_ts = ? \
             WHERE id = ? AND (tenant_id IS ? OR tenant_id = ?) AND sent_ts IS NULL AND error_ts IS NULL",
        )
        .bind(ts.timestamp())
        .bind(id)
        .bind(tenant_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_error(
        &self,
        id: &str,
        tenant_id: Option<&str>,
        ts: DateTime<Utc>,
        error_text: &str,
        next_deferred_ts: Option<DateTime<Utc>>,
        new_retry_count: u32,
    ) -> RelayResult<()> {
        match next_deferred_ts {
            Some(next) => {
                sqlx::query(
                    "UPDATE messages SET last_error = ?, deferred_ts = ?, retry_count = ? \
                     WHERE id = ? AND (tenant_id IS ? OR tenant_id = ?) AND sent_ts IS NULL AND error_ts IS NULL",
                )
                .bind(error_text)
                .bind(next.timestamp())
                .bind(new_retry_count as i64)
                .bind(id)
                .bind(tenant_id)
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE messages SET last_error = ?, error_ts = ?, retry_count = ? \
                     WHERE id = ? AND (tenant_id IS ? OR tenant_id = ?) AND sent_ts IS NULL AND error_ts IS NULL",
                )
                .bind(error_text)
                .bind(ts.timestamp())
                .bind(new_retry_count as i64)
                .bind(id)
                .bind(tenant_id)
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn list_terminal_unreported(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> RelayResult<Vec<Message>> {
        let rows = match tenant_id {
            Some(t) => sqlx::query(
                "SELECT * FROM messages \
                 WHERE (sent_ts IS NOT NULL OR error_ts IS NOT NULL) AND reported_ts IS NULL \
                 AND tenant_id = ? ORDER BY created_ts ASC LIMIT ?",
            )
            .bind(t)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?,
            None => sqlx::query(
                "SELECT * FROM messages \
                 WHERE (sent_ts IS NOT NULL OR error_ts IS NOT NULL) AND reported_ts IS NULL \
                 ORDER BY created_ts ASC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?,
        };
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn mark_reported(&self, ids: &[(String, Option<String>)], ts: DateTime<Utc>) -> RelayResult<()> {
        let _guard = self.writer_lock.lock().await;
        for (id, tenant_id) in ids {
            sqlx::query(
                "UPDATE messages SET reported_ts = ? \
                 WHERE id = ? AND (tenant_id IS ? OR tenant_id = ?) AND reported_ts IS NULL",
            )
            .bind(ts.timestamp())
            .bind(id)
            .bind(tenant_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn delete_reported_before(&self, tenant_id: Option<&str>, ts: DateTime<Utc>) -> RelayResult<u64> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE reported_ts IS NOT NULL AND reported_ts < ? \
             AND (tenant_id IS ? OR tenant_id = ?)",
        )
        .bind(ts.timestamp())
        .bind(tenant_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_send_log_before(&self, ts: DateTime<Utc>) -> RelayResult<u64> {
        let result = sqlx::query("DELETE FROM send_log WHERE ts < ?")
            .bind(ts.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_send_log(&self, entry: SendLogEntry) -> RelayResult<()> {
        sqlx::query("INSERT INTO send_log (account_id, ts) VALUES (?, ?)")
            .bind(&entry.account_id)
            .bind(entry.ts.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_send_log_since(&self, account_id: &str, since_ts: DateTime<Utc>) -> RelayResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM send_log WHERE account_id = ? AND ts > ?")
            .bind(account_id)
            .bind(since_ts.timestamp())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("c")?)
    }

    async fn oldest_send_log_since(
        &self,
        account_id: &str,
        since_ts: DateTime<Utc>,
    ) -> RelayResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MIN(ts) as oldest FROM send_log WHERE account_id = ? AND ts > ?",
        )
        .bind(account_id)
        .bind(since_ts.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>("oldest")?.and_then(|s| DateTime::from_timestamp(s, 0)))
    }

    async fn upsert_account(&self, account: Account) -> RelayResult<()> {
        let tls_mode = match account.tls_mode {
            TlsMode::None => "none",
            TlsMode::Starttls => "starttls",
            TlsMode::Implicit => "implicit",
        };
        let policy = match account.over_limit_policy {
            OverLimitPolicy::Defer => "defer",
            OverLimitPolicy::Reject => "reject",
        };
        sqlx::query(
            r#"
            INSERT INTO accounts
                (id, tenant_id, host, port, tls_mode, username, encrypted_password,
                 limit_per_minute, limit_per_hour, limit_per_day, over_limit_policy,
                 batch_size_hint, connection_ttl_hint_secs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                tenant_id = excluded.tenant_id, host = excluded.host, port = excluded.port,
                tls_mode = excluded.tls_mode, username = excluded.username,
                encrypted_password = excluded.encrypted_password,
                limit_per_minute = excluded.limit_per_minute, limit_per_hour = excluded.limit_per_hour,
                limit_per_day = excluded.limit_per_day, over_limit_policy = excluded.over_limit_policy,
                batch_size_hint = excluded.batch_size_hint,
                connection_ttl_hint_secs = excluded.connection_ttl_hint_secs
            "#,
        )
        .bind(&account.id)
        .bind(&account.tenant_id)
        .bind(&account.host)
        .bind(account.port as i64)
        .bind(tls_mode)
        .bind(&account.username)
        .bind(account.encrypted_password.as_ref().map(|p| p.expose_secret().clone()))
        .bind(account.limits.per_minute.map(|v| v as i64))
        .bind(account.limits.per_hour.map(|v| v as i64))
        .bind(account.limits.per_day.map(|v| v as i64))
        .bind(policy)
        .bind(account.batch_size_hint.map(|v| v as i64))
        .bind(account.connection_ttl_hint.map(|d| d.num_seconds()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_accounts(&self) -> RelayResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts").fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_account).collect()
    }

    async fn get_account(&self, id: &str) -> RelayResult<Option<Account>> {
        let row = sqlx::query("SELECT * FROM accounts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn delete_account(&self, id: &str) -> RelayResult<()> {
        sqlx::query("DELETE FROM accounts WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> RelayResult<()> {
        let auth_json = serde_json::to_string(&tenant.outbound_auth)?;
        let suspended_json = serde_json::to_string(&tenant.suspended_batches)?;
        sqlx::query(
            r#"
            INSERT INTO tenants
                (id, display_name, report_sink_base_url, report_sink_path,
                 attachment_endpoint_base_url, attachment_endpoint_path,
                 outbound_auth_json, active, suspended_batches_json, retention_override_secs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                report_sink_base_url = excluded.report_sink_base_url,
                report_sink_path = excluded.report_sink_path,
                attachment_endpoint_base_url = excluded.attachment_endpoint_base_url,
                attachment_endpoint_path = excluded.attachment_endpoint_path,
                outbound_auth_json = excluded.outbound_auth_json,
                active = excluded.active,
                suspended_batches_json = excluded.suspended_batches_json,
                retention_override_secs = excluded.retention_override_secs
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.display_name)
        .bind(&tenant.report_sink_base_url)
        .bind(&tenant.report_sink_path)
        .bind(&tenant.attachment_endpoint_base_url)
        .bind(&tenant.attachment_endpoint_path)
        .bind(auth_json)
        .bind(tenant.active)
        .bind(suspended_json)
        .bind(tenant.retention_override.map(|d| d.num_seconds()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tenants(&self) -> RelayResult<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants").fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_tenant).collect()
    }

    async fn get_tenant(&self, id: &str) -> RelayResult<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_tenant).transpose()
    }

    async fn delete_tenant(&self, id: &str) -> RelayResult<()> {
        sqlx::query("DELETE FROM tenants WHERE id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_messages(&self, tenant_id: Option<&str>, active_only: bool) -> RelayResult<Vec<Message>> {
        let rows = match (tenant_id, active_only) {
            (Some(t), true) => sqlx::query(
                "SELECT * FROM messages WHERE tenant_id = ? AND sent_ts IS NULL AND error_ts IS NULL \
                 ORDER BY priority ASC, deferred_ts ASC",
            )
            .bind(t)
            .fetch_all(&self.pool)
            .await?,
            (Some(t), false) => sqlx::query("SELECT * FROM messages WHERE tenant_id = ? ORDER BY created_ts ASC")
                .bind(t)
                .fetch_all(&self.pool)
                .await?,
            (None, true) => sqlx::query(
                "SELECT * FROM messages WHERE sent_ts IS NULL AND error_ts IS NULL \
                 ORDER BY priority ASC, deferred_ts ASC",
            )
            .fetch_all(&self.pool)
            .await?,
            (None, false) => sqlx::query("SELECT * FROM messages ORDER BY created_ts ASC")
                .fetch_all(&self.pool)
                .await?,
        };
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn delete_messages(&self, tenant_id: Option<&str>, ids: &[String]) -> RelayResult<(u64, u64)> {
        let _guard = self.writer_lock.lock().await;
        let mut removed = 0u64;
        let mut not_found = 0u64;
        for id in ids {
            let result = sqlx::query(
                "DELETE FROM messages WHERE id = ? AND (tenant_id IS ? OR tenant_id = ?)",
            )
            .bind(id)
            .bind(tenant_id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                removed += 1;
            } else {
                not_found += 1;
            }
        }
        Ok((removed, not_found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessagePayload;
    use uuid::Uuid;

    async fn test_storage() -> SqliteStorage {
        SqliteStorage::connect("sqlite::memory:").await.unwrap()
    }

    fn sample_message(id: &str) -> Message {
        Message {
            id: id.to_string(),
            pk: Uuid::new_v4(),
            tenant_id: None,
            account_id: "A".to_string(),
            priority: Priority::Medium,
            batch_code: None,
            deferred_ts: Utc::now(),
            retry_count: 0,
            last_error: None,
            payload: MessagePayload {
                from: "a@x".to_string(),
                to: vec!["b@y".to_string()],
                subject: "hi".to_string(),
                body: "ok".to_string(),
                ..Default::default()
            },
            created_ts: Utc::now(),
            sent_ts: None,
            error_ts: None,
            bounce_ts: None,
            reported_ts: None,
        }
    }

    #[tokio::test]
    async fn insert_then_claim_then_mark_sent() {
        let storage = test_storage().await;
        let outcome = storage.insert_messages(vec![sample_message("M1")]).await.unwrap();
        assert_eq!(outcome.accepted_ids, vec!["M1".to_string()]);
        assert!(outcome.rejected.is_empty());

        let mut quota = AccountQuotaMap::new();
        quota.insert("A".to_string(), 10);
        let claimed = storage.claim_ready(Utc::now(), &quota, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        storage.mark_sent("M1", None, Utc::now()).await.unwrap();
        let msgs = storage.list_messages(None, false).await.unwrap();
        assert!(msgs[0].sent_ts.is_some());

        // Idempotent: a second mark_sent with a later timestamp must not move it.
        let first_ts = msgs[0].sent_ts.unwrap();
        storage.mark_sent("M1", None, Utc::now() + chrono::Duration::seconds(50)).await.unwrap();
        let msgs = storage.list_messages(None, false).await.unwrap();
        assert_eq!(msgs[0].sent_ts.unwrap(), first_ts);
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let storage = test_storage().await;
        storage.insert_messages(vec![sample_message("M1")]).await.unwrap();
        let outcome = storage.insert_messages(vec![sample_message("M1")]).await.unwrap();
        assert!(outcome.accepted_ids.is_empty());
        assert_eq!(outcome.rejected[0].reason, "duplicate");
    }

    #[tokio::test]
    async fn empty_recipients_rejected() {
        let storage = test_storage().await;
        let mut m = sample_message("M2");
        m.payload.to.clear();
        let outcome = storage.insert_messages(vec![m]).await.unwrap();
        assert!(outcome.accepted_ids.is_empty());
        assert_eq!(outcome.rejected[0].reason, "empty recipient list");
    }

    #[tokio::test]
    async fn far_future_deferred_not_claimed() {
        let storage = test_storage().await;
        let mut m = sample_message("M3");
        m.deferred_ts = Utc::now() + chrono::Duration::days(365);
        storage.insert_messages(vec![m]).await.unwrap();

        let mut quota = AccountQuotaMap::new();
        quota.insert("A".to_string(), 10);
        let claimed = storage.claim_ready(Utc::now(), &quota, 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn delete_reported_before_is_scoped_per_tenant() {
        let storage = test_storage().await;

        let mut tenant_msg = sample_message("M4");
        tenant_msg.tenant_id = Some("T1".to_string());
        let mut other_msg = sample_message("M5");
        other_msg.tenant_id = None;

        storage.insert_messages(vec![tenant_msg, other_msg]).await.unwrap();
        storage
            .mark_reported(&[("M4".to_string(), Some("T1".to_string())), ("M5".to_string(), None)], Utc::now())
            .await
            .unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);

        // Deleting T1's backlog must not touch the tenant-less message.
        let purged = storage.delete_reported_before(Some("T1"), cutoff).await.unwrap();
        assert_eq!(purged, 1);
        let remaining = storage.list_messages(None, false).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "M5");

        let purged = storage.delete_reported_before(None, cutoff).await.unwrap();
        assert_eq!(purged, 1);
    }
}
