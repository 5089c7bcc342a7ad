//! `relaycore`: an asynchronous SMTP relay core — durable priority queue,
//! per-account rate limiting, connection pooling with retry/backoff,
//! attachment materialization and delivery reporting.
//!
//! The REST/CLI surface, credential encryption at rest, Prometheus
//! exposition and IMAP bounce detection are out of scope for this crate;
//! it is a library plus a minimal service binary (`relaycored`) meant to
//! be embedded by those external surfaces.

pub mod attachments;
pub mod cache;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod rate_limiter;
pub mod report;
pub mod smtp;
pub mod storage;
pub mod types;

use crate::attachments::AttachmentResolver;
use crate::cache::{AttachmentCache, CacheConfig};
use crate::cleanup::CleanupLoop;
use crate::config::RelayConfig;
use crate::coordinator::Coordinator;
use crate::dispatch::DispatchLoop;
use crate::error::{RelayError, RelayResult};
use crate::report::ReportLoop;
use crate::smtp::SmtpConnectionPool;
use crate::smtp::classifier::RetrySchedule;
use crate::storage::postgres::PostgresStorage;
use crate::storage::sqlite::SqliteStorage;
use crate::storage::StorageAdapter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use error::RelayResult as Result;

/// Builds every collaborator from config and wires them into a
/// `Coordinator`: one composition root that owns construction order,
/// nowhere else reaches for a global.
pub async fn build(config: RelayConfig) -> RelayResult<Coordinator> {
    let storage: Arc<dyn StorageAdapter> = if config.storage.database_url.starts_with("postgres") {
        Arc::new(PostgresStorage::connect(&config.storage.database_url).await?)
    } else {
        Arc::new(SqliteStorage::connect(&config.storage.database_url).await?)
    };

    let http_client = reqwest::Client::builder()
        .timeout(config.http.request_timeout)
        .build()
        .map_err(RelayError::from)?;

    let cache = Arc::new(AttachmentCache::new(CacheConfig {
        memory_capacity_bytes: config.cache.memory_capacity_bytes,
        disk_capacity_bytes: config.cache.disk_capacity_bytes,
        disk_dir: PathBuf::from(&config.cache.disk_dir),
        entry_ttl: chrono::Duration::from_std(config.cache.entry_ttl).unwrap_or(chrono::Duration::hours(24)),
    }));

    let attachments = Arc::new(AttachmentResolver::new(
        PathBuf::from(&config.http.filesystem_base_dir),
        http_client.clone(),
        cache.clone(),
        config.concurrency.attachment_concurrency,
    ));

    let smtp_pool = Arc::new(SmtpConnectionPool::new(
        config.smtp.max_per_account,
        chrono::Duration::from_std(config.smtp.idle_ttl).unwrap_or(chrono::Duration::seconds(120)),
    ));

    let retry_schedule = RetrySchedule::new(config.retry.schedule.clone(), config.retry.jitter_fraction);

    let running = Arc::new(AtomicBool::new(false));

    let dispatch = Arc::new(DispatchLoop::new(
        storage.clone(),
        smtp_pool.clone(),
        attachments.clone(),
        cache.clone(),
        retry_schedule,
        config.loops.dispatch_batch_size,
        config.concurrency.max_concurrent_sends,
        config.concurrency.max_concurrent_per_account,
        running.clone(),
    ));

    let report = Arc::new(ReportLoop::new(
        storage.clone(),
        http_client,
        config.loops.report_batch_size,
        running.clone(),
    ));

    let default_retention = chrono::Duration::from_std(config.retention.default_retention)
        .unwrap_or(chrono::Duration::days(30));
    let send_log_retention = chrono::Duration::from_std(config.retention.send_log_retention)
        .unwrap_or(chrono::Duration::days(2));

    let cleanup = Arc::new(CleanupLoop::new(
        storage.clone(),
        smtp_pool,
        default_retention,
        send_log_retention,
        running.clone(),
    ));

    tracing::info!(
        dispatch_tick = %humantime::format_duration(config.loops.dispatch_tick),
        report_tick = %humantime::format_duration(config.loops.report_tick),
        cleanup_tick = %humantime::format_duration(config.loops.cleanup_tick),
        "relay core assembled"
    );

    Ok(Coordinator::new(storage, dispatch, report, cleanup, running, config))
}
