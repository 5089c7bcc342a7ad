//! Networked relational storage adapter backed by PostgreSQL.
//!
//! Unlike the embedded SQLite adapter, `claim_ready` here uses row-level
//! locking (`FOR UPDATE SKIP LOCKED`) so multiple relay instances can share
//! one database without a process-wide writer mutex, per Design Notes §9.
//! A claimed row's `deferred_ts` is pushed forward by a short lease window
//! in the same transaction, so a second instance's concurrent claim simply
//! skips it instead of double-dispatching; `mark_sent`/`mark_error` clear
//! or replace the lease.

use crate::error::RelayResult;
use crate::storage::{AccountQuotaMap, InsertOutcome, StorageAdapter};
use crate::types::{
    Account, Message, MessagePayload, OverLimitPolicy, Priority, RateWindowLimits,
    RejectedMessage, SendLogEntry, Tenant, TlsMode,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

const CLAIM_LEASE: i64 = 30;

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub async fn connect(database_url: &str) -> RelayResult<Self> {
        let pool = PgPoolOptions::new().max_connections(16).connect(database_url).await?;
        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> RelayResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                pk UUID PRIMARY KEY,
                id TEXT NOT NULL,
                tenant_id TEXT,
                account_id TEXT NOT NULL,
                priority SMALLINT NOT NULL,
                batch_code TEXT,
                deferred_ts TIMESTAMPTZ NOT NULL,
                retry_count INTEGER NOT NULL,
                last_error TEXT,
                payload_json JSONB NOT NULL,
                created_ts TIMESTAMPTZ NOT NULL,
                sent_ts TIMESTAMPTZ,
                error_ts TIMESTAMPTZ,
                bounce_ts TIMESTAMPTZ,
                reported_ts TIMESTAMPTZ,
                UNIQUE (id, tenant_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_ready ON messages \
             (priority, deferred_ts, created_ts) WHERE sent_ts IS NULL AND error_ts IS NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_unreported ON messages (tenant_id, reported_ts)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS send_log (account_id TEXT NOT NULL, ts TIMESTAMPTZ NOT NULL)",
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
                connection_ttl_hint_secs BIGINT
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
                outbound_auth_json JSONB NOT NULL,
                active BOOLEAN NOT NULL,
                suspended_batches_json JSONB NOT NULL,
                retention_override_secs BIGINT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_message(row: &sqlx::postgres::PgRow) -> RelayResult<Message> {
        let payload_json: serde_json::Value = row.try_get("payload_json")?;
        let payload: MessagePayload = serde_json::from_value(payload_json)?;
        let priority = match row.try_get::<i16, _>("priority")? {
            0 => Priority::Immediate,
            1 => Priority::High,
            2 => Priority::Medium,
            _ => Priority::Low,
        };
        Ok(Message {
            id: row.try_get("id")?,
            pk: row.try_get("pk")?,
            tenant_id: row.try_get("tenant_id")?,
            account_id: row.try_get("account_id")?,
            priority,
            batch_code: row.try_get("batch_code")?,
            deferred_ts: row.try_get("deferred_ts")?,
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            last_error: row.try_get("last_error")?,
            payload,
            created_ts: row.try_get("created_ts")?,
            sent_ts: row.try_get("sent_ts")?,
            error_ts: row.try_get("error_ts")?,
            bounce_ts: row.try_get("bounce_ts")?,
            reported_ts: row.try_get("reported_ts")?,
        })
    }

    fn row_to_tenant(row: &sqlx::postgres::PgRow) -> RelayResult<Tenant> {
        let auth_json: serde_json::Value = row.try_get("outbound_auth_json")?;
        let suspended_json: serde_json::Value = row.try_get("suspended_batches_json")?;
        Ok(Tenant {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            report_sink_base_url: row.try_get("report_sink_base_url")?,
            report_sink_path: row.try_get("report_sink_path")?,
            attachment_endpoint_base_url: row.try_get("attachment_endpoint_base_url")?,
            attachment_endpoint_path: row.try_get("attachment_endpoint_path")?,
            outbound_auth: serde_json::from_value(auth_json)?,
            active: row.try_get("active")?,
            suspended_batches: serde_json::from_value(suspended_json)?,
            retention_override: row
                .try_get::<Option<i64>, _>("retention_override_secs")?
                .map(Duration::seconds),
        })
    }

    fn row_to_account(row: &sqlx::postgres::PgRow) -> RelayResult<Account> {
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
            port: row.try_get::<i32, _>("port")? as u16,
            tls_mode,
            username: row.try_get("username")?,
            encrypted_password: row
                .try_get::<Option<String>, _>("encrypted_password")?
                .map(secrecy::SecretString::new),
            limits: RateWindowLimits {
                per_minute: row.try_get::<Option<i32>, _>("limit_per_minute")?.map(|v| v as u32),
                per_hour: row.try_get::<Option<i32>, _>("limit_per_hour")?.map(|v| v as u32),
                per_day: row.try_get::<Option<i32>, _>("limit_per_day")?.map(|v| v as u32),
            },
            over_limit_policy,
            batch_size_hint: row.try_get::<Option<i32>, _>("batch_size_hint")?.map(|v| v as usize),
            connection_ttl_hint: row
                .try_get::<Option<i64>, _>("connection_ttl_hint_secs")?
                .map(Duration::seconds),
        })
    }
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
impl StorageAdapter for PostgresStorage {
    async fn insert_messages(&self, batch: Vec<Message>) -> RelayResult<InsertOutcome> {
        let mut out = InsertOutcome::default();
        let mut tx = self.pool.begin().await?;

        for m in batch {
            if let Some(reason) = validate_payload(&m) {
                out.rejected.push(RejectedMessage { id: m.id, reason });
                continue;
            }

            let exists: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM messages WHERE id = $1 AND tenant_id IS NOT DISTINCT FROM $2",
            )
            .bind(&m.id)
            .bind(&m.tenant_id)
            .fetch_optional(&mut *tx)
            .await?;

            if exists.is_some() {
                out.rejected.push(RejectedMessage { id: m.id, reason: "duplicate".to_string() });
                continue;
            }

            let payload_json = serde_json::to_value(&m.payload)?;
            sqlx::query(
                r#"
                INSERT INTO messages
                    (pk, id, tenant_id, account_id, priority, batch_code, deferred_ts,
                     retry_count, last_error, payload_json, created_ts)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(m.pk)
            .bind(&m.id)
            .bind(&m.tenant_id)
            .bind(&m.account_id)
            .bind(m.priority as i16)
            .bind(&m.batch_code)
            .bind(m.deferred_ts)
            .bind(m.retry_count as i32)
            .bind(&m.last_error)
            .bind(payload_json)
            .bind(m.created_ts)
            .execute(&mut *tx)
            .await?;

            out.accepted_ids.push(m.id);
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn claim_ready(
        &self,
        now: DateTime<Utc>,
        account_quota_map: &AccountQuotaMap,
        limit: usize,
    ) -> RelayResult<Vec<Message>> {
        let mut tx = self.pool.begin().await?;

        let scan_limit = (limit * 8).max(limit + 64) as i64;
        let rows = sqlx::query(
            r#"
            SELECT m.* FROM messages m
            LEFT JOIN tenants t ON t.id = m.tenant_id
            WHERE m.sent_ts IS NULL AND m.error_ts IS NULL AND m.deferred_ts <= $1
              AND (t.id IS NULL OR t.active)
            ORDER BY m.priority ASC, m.deferred_ts ASC, m.created_ts ASC
            LIMIT $2
            FOR UPDATE OF m SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(scan_limit)
        .fetch_all(&mut *tx)
        .await?;

        let tenant_rows = sqlx::query("SELECT * FROM tenants").fetch_all(&mut *tx).await?;
        let mut tenants = std::collections::HashMap::new();
        for row in &tenant_rows {
            let t = Self::row_to_tenant(row)?;
            tenants.insert(t.id.clone(), t);
        }

        let mut remaining_quota: std::collections::HashMap<&str, u32> =
            account_quota_map.iter().map(|(k, v)| (k.as_str(), *v)).collect();

        let mut claimed = Vec::with_capacity(limit);
        let lease_until = now + Duration::seconds(CLAIM_LEASE);

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
                    if tenant.suspended_batches.suspends(msg.batch_code.as_deref()) {
                        continue;
                    }
                }
            }

            sqlx::query("UPDATE messages SET deferred_ts = $1 WHERE pk = $2")
                .bind(lease_until)
                .bind(msg.pk)
                .execute(&mut *tx)
                .await?;

            *remaining_quota.get_mut(msg.account_id.as_str()).unwrap() = quota - 1;
            claimed.push(msg);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_sent(&self, id: &str, tenant_id: Option<&str>, ts: DateTime<Utc>) -> RelayResult<()> {
        sqlx::query(
            "UPDATE messages SET sent_ts = $1 WHERE id = $2 AND tenant_id IS NOT DISTINCT FROM $3 \
             AND sent_ts IS NULL AND error_ts IS NULL",
        )
        .bind(ts)
        .bind(id)
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
                    "UPDATE messages SET last_error = $1, deferred_ts = $2, retry_count = $3 \
                     WHERE id = $4 AND tenant_id IS NOT DISTINCT FROM $5 \
                     AND sent_ts IS NULL AND error_ts IS NULL",
                )
                .bind(error_text)
                .bind(next)
                .bind(new_retry_count as i32)
                .bind(id)
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE messages SET last_error = $1, error_ts = $2, retry_count = $3 \
                     WHERE id = $4 AND tenant_id IS NOT DISTINCT FROM $5 \
                     AND sent_ts IS NULL AND error_ts IS NULL",
                )
                .bind(error_text)
                .bind(ts)
                .bind(new_retry_count as i32)
                .bind(id)
                .bind(tenant_id)
                .execute(&self.pool)
                .await?;
            }
        }
        let _ = ts;
        Ok(())
    }

    async fn list_terminal_unreported(
        &self,
        limit: usize,
        tenant_id: Option<&str>,
    ) -> RelayResult<Vec<Message>> {
        let rows = match tenant_id {
            Some(t) => sqlx::query(
                "SELECT * FROM messages WHERE (sent_ts IS NOT NULL OR error_ts IS NOT NULL) \
                 AND reported_ts IS NULL AND tenant_id = $1 ORDER BY created_ts ASC LIMIT $2",
            )
            .bind(t)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?,
            None => sqlx::query(
                "SELECT * FROM messages WHERE (sent_ts IS NOT NULL OR error_ts IS NOT NULL) \
                 AND reported_ts IS NULL ORDER BY created_ts ASC LIMIT $1",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?,
        };
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn mark_reported(&self, ids: &[(String, Option<String>)], ts: DateTime<Utc>) -> RelayResult<()> {
        let mut tx = self.pool.begin().await?;
        for (id, tenant_id) in ids {
            sqlx::query(
                "UPDATE messages SET reported_ts = $1 WHERE id = $2 AND tenant_id IS NOT DISTINCT FROM $3 \
                 AND reported_ts IS NULL",
            )
            .bind(ts)
            .bind(id)
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_reported_before(&self, tenant_id: Option<&str>, ts: DateTime<Utc>) -> RelayResult<u64> {
        let result = sqlx::query(
            "DELETE FROM messages WHERE reported_ts IS NOT NULL AND reported_ts < $1 \
             AND tenant_id IS NOT DISTINCT FROM $2",
        )
        .bind(ts)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_send_log_before(&self, ts: DateTime<Utc>) -> RelayResult<u64> {
        let result = sqlx::query("DELETE FROM send_log WHERE ts < $1")
            .bind(ts)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn append_send_log(&self, entry: SendLogEntry) -> RelayResult<()> {
        sqlx::query("INSERT INTO send_log (account_id, ts) VALUES ($1, $2)")
            .bind(&entry.account_id)
            .bind(entry.ts)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_send_log_since(&self, account_id: &str, since_ts: DateTime<Utc>) -> RelayResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM send_log WHERE account_id = $1 AND ts > $2")
            .bind(account_id)
            .bind(since_ts)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("c")?)
    }

    async fn oldest_send_log_since(
        &self,
        account_id: &str,
        since_ts: DateTime<Utc>,
    ) -> RelayResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MIN(ts) as oldest FROM send_log WHERE account_id = $1 AND ts > $2")
            .bind(account_id)
            .bind(since_ts)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("oldest")?)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
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
        .bind(account.port as i32)
        .bind(tls_mode)
        .bind(&account.username)
        .bind(account.encrypted_password.as_ref().map(|p| p.expose_secret().clone()))
        .bind(account.limits.per_minute.map(|v| v as i32))
        .bind(account.limits.per_hour.map(|v| v as i32))
        .bind(account.limits.per_day.map(|v| v as i32))
        .bind(policy)
        .bind(account.batch_size_hint.map(|v| v as i32))
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
        let row = sqlx::query("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_account).transpose()
    }

    async fn delete_account(&self, id: &str) -> RelayResult<()> {
        sqlx::query("DELETE FROM accounts WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> RelayResult<()> {
        let auth_json = serde_json::to_value(&tenant.outbound_auth)?;
        let suspended_json = serde_json::to_value(&tenant.suspended_batches)?;
        sqlx::query(
            r#"
            INSERT INTO tenants
                (id, display_name, report_sink_base_url, report_sink_path,
                 attachment_endpoint_base_url, attachment_endpoint_path,
                 outbound_auth_json, active, suspended_batches_json, retention_override_secs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
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
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_tenant).transpose()
    }

    async fn delete_tenant(&self, id: &str) -> RelayResult<()> {
        sqlx::query("DELETE FROM tenants WHERE id = $1").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list_messages(&self, tenant_id: Option<&str>, active_only: bool) -> RelayResult<Vec<Message>> {
        let rows = match (tenant_id, active_only) {
            (Some(t), true) => sqlx::query(
                "SELECT * FROM messages WHERE tenant_id = $1 AND sent_ts IS NULL AND error_ts IS NULL \
                 ORDER BY priority ASC, deferred_ts ASC",
            )
            .bind(t)
            .fetch_all(&self.pool)
            .await?,
            (Some(t), false) => sqlx::query("SELECT * FROM messages WHERE tenant_id = $1 ORDER BY created_ts ASC")
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
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        let mut not_found = 0u64;
        for id in ids {
            let result = sqlx::query("DELETE FROM messages WHERE id = $1 AND tenant_id IS NOT DISTINCT FROM $2")
                .bind(id)
                .bind(tenant_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                removed += 1;
            } else {
                not_found += 1;
            }
        }
        tx.commit().await?;
        Ok((removed, not_found))
    }
}
