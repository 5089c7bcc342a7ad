//! Per-account SMTP connection pool with lease-based reuse and idle
//! reaping.
//!
//! A `Vec<T>` of idle connections behind a `Mutex`, capped by a
//! `Semaphore` permit per account rather than a single global cap, so one
//! noisy account can't starve another's deliveries.

use crate::error::{RelayError, RelayResult};
use crate::types::{Account, TlsMode};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

struct IdleConnection {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    last_used: DateTime<Utc>,
}

struct AccountPool {
    idle: Mutex<Vec<IdleConnection>>,
    permits: Arc<Semaphore>,
}

/// Keyed by account id. Each account gets its own idle connection stack
/// and its own concurrency cap (`max_per_account`), so the pool as a whole
/// scales with the number of distinct sending accounts.
pub struct SmtpConnectionPool {
    accounts: DashMap<String, Arc<AccountPool>>,
    max_per_account: usize,
    idle_ttl: chrono::Duration,
}

/// A leased transport. Dropping without calling `release` simply discards
/// the connection rather than returning it to the pool — safe default for
/// a connection that may be in an unknown state after an error.
pub struct Lease {
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
    pub account_id: String,
    pool: Arc<AccountPool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

impl Lease {
    pub async fn send(&self, message: &LettreMessage) -> RelayResult<lettre::transport::smtp::response::Response> {
        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| RelayError::internal("lease used after release"))?;
        transport.send(message).await.map_err(RelayError::from)
    }

    /// Returns the connection to its account's idle stack for reuse.
    pub async fn release(mut self) {
        if let Some(transport) = self.transport.take() {
            let mut idle = self.pool.idle.lock().await;
            idle.push(IdleConnection { transport, last_used: Utc::now() });
        }
    }
}

impl SmtpConnectionPool {
    pub fn new(max_per_account: usize, idle_ttl: chrono::Duration) -> Self {
        Self { accounts: DashMap::new(), max_per_account: max_per_account.max(1), idle_ttl }
    }

    fn account_pool(&self, account_id: &str) -> Arc<AccountPool> {
        self.accounts
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(AccountPool {
                    idle: Mutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(self.max_per_account)),
                })
            })
            .clone()
    }

    /// Acquires a connection for `account`, reusing an idle one if present,
    /// not past its TTL, and still alive, else building a fresh transport.
    /// Blocks until a permit frees up if the account is already at
    /// `max_per_account`.
    pub async fn acquire(&self, account: &Account) -> RelayResult<Lease> {
        let pool = self.account_pool(&account.id);
        let permit = pool
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RelayError::internal("smtp pool semaphore closed"))?;

        let reused = {
            let mut idle = pool.idle.lock().await;
            loop {
                match idle.pop() {
                    Some(conn) if Utc::now() - conn.last_used <= self.idle_ttl => break Some(conn.transport),
                    Some(_) => continue,
                    None => break None,
                }
            }
        };

        // A reused connection may have been closed by the peer while idle;
        // probe with a lightweight NOOP before handing it out rather than
        // discovering that on the caller's actual send.
        let transport = match reused {
            Some(t) => match t.test_connection().await {
                Ok(true) => t,
                _ => build_transport(account)?,
            },
            None => build_transport(account)?,
        };

        Ok(Lease { transport: Some(transport), account_id: account.id.clone(), pool, _permit: permit })
    }

    /// Drops idle connections past their TTL across all accounts. Called
    /// by the cleanup loop.
    pub async fn reap_idle(&self) {
        for entry in self.accounts.iter() {
            let mut idle = entry.value().idle.lock().await;
            let ttl = self.idle_ttl;
            idle.retain(|conn| Utc::now() - conn.last_used <= ttl);
        }
    }
}

fn build_transport(account: &Account) -> RelayResult<AsyncSmtpTransport<Tokio1Executor>> {
    let mut builder = match account.tls_mode {
        TlsMode::Implicit => {
            let tls = TlsParameters::new(account.host.clone())
                .map_err(|e| RelayError::internal(format!("tls params: {e}")))?;
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.host).tls(Tls::Wrapper(tls))
        }
        TlsMode::Starttls => {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&account.host)
                .map_err(RelayError::from)?
        }
        TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&account.host).tls(Tls::None),
    };

    builder = builder.port(account.port);

    if let Some(username) = &account.username {
        let password = account
            .encrypted_password
            .as_ref()
            .map(|p| p.expose_secret().clone())
            .unwrap_or_default();
        builder = builder.credentials(Credentials::new(username.clone(), password));
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OverLimitPolicy, RateWindowLimits};

    fn account() -> Account {
        Account {
            id: "A1".to_string(),
            tenant_id: None,
            host: "localhost".to_string(),
            port: 2525,
            tls_mode: TlsMode::None,
            username: None,
            encrypted_password: None,
            limits: RateWindowLimits::unbounded(),
            over_limit_policy: OverLimitPolicy::Defer,
            batch_size_hint: None,
            connection_ttl_hint: None,
        }
    }

    #[tokio::test]
    async fn acquire_builds_and_release_returns_to_idle() {
        let pool = SmtpConnectionPool::new(2, chrono::Duration::seconds(60));
        let acct = account();
        let lease = pool.acquire(&acct).await.unwrap();
        lease.release().await;

        let account_pool = pool.account_pool(&acct.id);
        assert_eq!(account_pool.idle.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn second_acquire_reuses_idle_connection() {
        let pool = SmtpConnectionPool::new(2, chrono::Duration::seconds(60));
        let acct = account();
        let lease = pool.acquire(&acct).await.unwrap();
        lease.release().await;

        let _lease2 = pool.acquire(&acct).await.unwrap();
        let account_pool = pool.account_pool(&acct.id);
        assert_eq!(account_pool.idle.lock().await.len(), 0);
    }
}
