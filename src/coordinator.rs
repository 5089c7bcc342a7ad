//! Lifecycle and control-plane operations: starts/stops the three loops,
//! and exposes submit/list/delete/suspend/activate/run_now.
//!
//! Owns an `Arc<AtomicBool>` running flag shared with its background
//! tasks, and exposes `start`/`stop`/`run_now` as the public control
//! surface.

use crate::cleanup::CleanupLoop;
use crate::config::RelayConfig;
use crate::dispatch::DispatchLoop;
use crate::error::{RelayError, RelayResult};
use crate::report::ReportLoop;
use crate::storage::{InsertOutcome, StorageAdapter};
use crate::types::{Message, MessagePayload, RejectedMessage, SubmitMessage, SuspendedBatches};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::info;
use uuid::Uuid;

pub struct Coordinator {
    storage: Arc<dyn StorageAdapter>,
    dispatch: Arc<DispatchLoop>,
    report: Arc<ReportLoop>,
    cleanup: Arc<CleanupLoop>,
    running: Arc<AtomicBool>,
    config: RelayConfig,
    tasks: TaskTracker,
}

impl Coordinator {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        dispatch: Arc<DispatchLoop>,
        report: Arc<ReportLoop>,
        cleanup: Arc<CleanupLoop>,
        running: Arc<AtomicBool>,
        config: RelayConfig,
    ) -> Self {
        Self { storage, dispatch, report, cleanup, running, config, tasks: TaskTracker::new() }
    }

    /// Spawns the dispatch, report and cleanup loops as background tasks
    /// tracked by a `TaskTracker`, so `shutdown` can wait for all three to
    /// actually exit rather than just signalling them.
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);

        let dispatch = self.dispatch.clone();
        let dispatch_tick = self.config.loops.dispatch_tick;
        self.tasks.spawn(async move { dispatch.run(dispatch_tick).await });

        let report = self.report.clone();
        let report_tick = self.config.loops.report_tick;
        self.tasks.spawn(async move { report.run(report_tick).await });

        let cleanup = self.cleanup.clone();
        let cleanup_tick = self.config.loops.cleanup_tick;
        self.tasks.spawn(async move { cleanup.run(cleanup_tick).await });

        info!("coordinator started");
    }

    /// Flips the running flag and waits for all three loops to observe it
    /// and exit their current tick.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.tasks.close();
        self.tasks.wait().await;
        info!("coordinator stopped");
    }

    /// Runs one dispatch tick immediately, independent of the loop's own
    /// interval, and returns once it completes — `run_now` is a synchronous
    /// trigger rather than a fire-and-forget wake signal (see DESIGN.md).
    pub async fn run_now(&self) -> RelayResult<crate::dispatch::DispatchTickSummary> {
        self.dispatch.tick().await
    }

    pub async fn submit(&self, tenant_id: Option<&str>, submissions: Vec<SubmitMessage>) -> RelayResult<InsertOutcome> {
        let now = Utc::now();
        let mut messages = Vec::with_capacity(submissions.len());

        let mut rejected = Vec::new();

        for submit in submissions {
            let account_id = match submit.account_id {
                Some(id) if !id.trim().is_empty() => id,
                _ => {
                    rejected.push(RejectedMessage { id: submit.id, reason: "missing account_id".to_string() });
                    continue;
                }
            };

            messages.push(Message {
                id: submit.id,
                pk: Uuid::new_v4(),
                tenant_id: tenant_id.map(str::to_string),
                account_id,
                priority: submit.priority.unwrap_or_default(),
                batch_code: submit.batch_code,
                deferred_ts: submit.deferred_ts.unwrap_or(now),
                retry_count: 0,
                last_error: None,
                payload: MessagePayload {
                    from: submit.from,
                    to: submit.to.into_vec(),
                    cc: submit.cc,
                    bcc: submit.bcc,
                    subject: submit.subject,
                    content_type: submit.content_type,
                    body: submit.body,
                    body_alt: None,
                    headers: submit.headers,
                    reply_to: submit.reply_to,
                    return_path: submit.return_path,
                    attachments: submit
                        .attachments
                        .into_iter()
                        .map(|a| crate::types::AttachmentDescriptor {
                            filename: a.filename.clone(),
                            mime_type: a.mime_type,
                            fetch_mode: a.fetch_mode.unwrap_or_else(|| crate::types::FetchMode::infer(&a.storage_path)),
                            storage_path: a.storage_path,
                            content_hash: None,
                            auth: a.auth,
                        })
                        .collect(),
                },
                created_ts: now,
                sent_ts: None,
                error_ts: None,
                bounce_ts: None,
                reported_ts: None,
            });
        }

        let mut outcome = self.storage.insert_messages(messages).await?;
        outcome.rejected.extend(rejected);
        Ok(outcome)
    }

    pub async fn list_messages(&self, tenant_id: Option<&str>, active_only: bool) -> RelayResult<Vec<Message>> {
        self.storage.list_messages(tenant_id, active_only).await
    }

    pub async fn delete_messages(&self, tenant_id: Option<&str>, ids: &[String]) -> RelayResult<(u64, u64)> {
        self.storage.delete_messages(tenant_id, ids).await
    }

    /// Suspends delivery for a tenant. `batch_code = None` suspends
    /// everything; `Some(tag)` adds one tag to the suspended set (merging
    /// with any existing tags) without affecting an existing "suspend all".
    pub async fn suspend(&self, tenant_id: &str, batch_code: Option<String>) -> RelayResult<()> {
        let mut tenant = self
            .storage
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| RelayError::not_found("tenant", tenant_id))?;

        tenant.suspended_batches = match (tenant.suspended_batches, batch_code) {
            (_, None) => SuspendedBatches::All,
            (SuspendedBatches::All, Some(_)) => SuspendedBatches::All,
            (SuspendedBatches::None, Some(tag)) => {
                SuspendedBatches::Tags(std::iter::once(tag).collect())
            }
            (SuspendedBatches::Tags(mut tags), Some(tag)) => {
                tags.insert(tag);
                SuspendedBatches::Tags(tags)
            }
        };

        self.storage.upsert_tenant(tenant).await
    }

    /// Reactivates delivery. `batch_code = None` clears all suspension.
    /// Activating a single tagged batch while the tenant is suspended as a
    /// whole ("suspend all") is a conflict — the caller must activate the
    /// whole tenant first (spec Open Question, resolved in DESIGN.md).
    pub async fn activate(&self, tenant_id: &str, batch_code: Option<String>) -> RelayResult<()> {
        let mut tenant = self
            .storage
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| RelayError::not_found("tenant", tenant_id))?;

        tenant.suspended_batches = match (tenant.suspended_batches, batch_code) {
            (_, None) => SuspendedBatches::None,
            (SuspendedBatches::All, Some(tag)) => {
                return Err(RelayError::conflict(format!(
                    "cannot activate batch {tag} while tenant {tenant_id} has all batches suspended; activate the whole tenant first"
                )))
            }
            (SuspendedBatches::None, Some(_)) => SuspendedBatches::None,
            (SuspendedBatches::Tags(mut tags), Some(tag)) => {
                tags.remove(&tag);
                if tags.is_empty() {
                    SuspendedBatches::None
                } else {
                    SuspendedBatches::Tags(tags)
                }
            }
        };

        self.storage.upsert_tenant(tenant).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::AttachmentResolver;
    use crate::cache::{AttachmentCache, CacheConfig};
    use crate::smtp::classifier::RetrySchedule;
    use crate::smtp::SmtpConnectionPool;
    use crate::storage::sqlite::SqliteStorage;
    use crate::types::{Auth, SuspendedBatches, Tenant};

    async fn test_coordinator() -> (Coordinator, tempfile::TempDir) {
        let tempdir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageAdapter> = Arc::new(SqliteStorage::connect("sqlite::memory:").await.unwrap());

        let cache = Arc::new(AttachmentCache::new(CacheConfig {
            memory_capacity_bytes: 1 << 20,
            disk_capacity_bytes: 1 << 20,
            disk_dir: tempdir.path().join("cache"),
            entry_ttl: chrono::Duration::hours(1),
        }));
        let attachments = Arc::new(AttachmentResolver::new(
            tempdir.path().join("attachments"),
            reqwest::Client::new(),
            cache.clone(),
            4,
        ));
        let smtp_pool = Arc::new(SmtpConnectionPool::new(4, chrono::Duration::seconds(60)));
        let retry_schedule =
            RetrySchedule::new(vec![std::time::Duration::from_secs(1), std::time::Duration::from_secs(60)], 0.1);
        let running = Arc::new(AtomicBool::new(false));

        let dispatch = Arc::new(DispatchLoop::new(
            storage.clone(),
            smtp_pool.clone(),
            attachments,
            cache,
            retry_schedule,
            10,
            4,
            2,
            running.clone(),
        ));
        let report = Arc::new(ReportLoop::new(storage.clone(), reqwest::Client::new(), 10, running.clone()));
        let cleanup = Arc::new(CleanupLoop::new(
            storage.clone(),
            smtp_pool,
            chrono::Duration::days(30),
            chrono::Duration::days(2),
            running.clone(),
        ));

        let config = RelayConfig::default();
        (Coordinator::new(storage, dispatch, report, cleanup, running, config), tempdir)
    }

    fn sample_submission(id: &str) -> SubmitMessage {
        SubmitMessage {
            id: id.to_string(),
            from: "sender@example.com".to_string(),
            to: crate::types::StringOrList::List(vec!["recipient@example.com".to_string()]),
            cc: vec![],
            bcc: vec![],
            subject: "hi".to_string(),
            body: "body".to_string(),
            content_type: Default::default(),
            headers: Default::default(),
            reply_to: None,
            return_path: None,
            priority: None,
            deferred_ts: None,
            batch_code: None,
            account_id: Some("acct1".to_string()),
            attachments: vec![],
        }
    }

    fn sample_tenant(id: &str) -> Tenant {
        Tenant {
            id: id.to_string(),
            display_name: "Tenant".to_string(),
            report_sink_base_url: "https://reports.example.com".to_string(),
            report_sink_path: "/v1/reports".to_string(),
            attachment_endpoint_base_url: None,
            attachment_endpoint_path: None,
            outbound_auth: Auth::None,
            active: true,
            suspended_batches: SuspendedBatches::None,
            retention_override: None,
        }
    }

    #[tokio::test]
    async fn submit_accepts_valid_and_rejects_missing_account() {
        let (coordinator, _tempdir) = test_coordinator().await;
        let mut missing_account = sample_submission("M2");
        missing_account.account_id = None;

        let outcome = coordinator
            .submit(None, vec![sample_submission("M1"), missing_account])
            .await
            .unwrap();

        assert_eq!(outcome.accepted_ids.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].id, "M2");
        assert_eq!(outcome.rejected[0].reason, "missing account_id");
    }

    #[tokio::test]
    async fn suspend_all_then_activate_clears_suspension() {
        let (coordinator, _tempdir) = test_coordinator().await;
        coordinator.storage.upsert_tenant(sample_tenant("t1")).await.unwrap();

        coordinator.suspend("t1", None).await.unwrap();
        let tenant = coordinator.storage.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(tenant.suspended_batches, SuspendedBatches::All);

        coordinator.activate("t1", None).await.unwrap();
        let tenant = coordinator.storage.get_tenant("t1").await.unwrap().unwrap();
        assert_eq!(tenant.suspended_batches, SuspendedBatches::None);
    }

    #[tokio::test]
    async fn activate_single_batch_while_all_suspended_conflicts() {
        let (coordinator, _tempdir) = test_coordinator().await;
        coordinator.storage.upsert_tenant(sample_tenant("t1")).await.unwrap();
        coordinator.suspend("t1", None).await.unwrap();

        let result = coordinator.activate("t1", Some("batch-a".to_string())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn suspend_then_activate_single_tag() {
        let (coordinator, _tempdir) = test_coordinator().await;
        coordinator.storage.upsert_tenant(sample_tenant("t1")).await.unwrap();

        coordinator.suspend("t1", Some("batch-a".to_string())).await.unwrap();
        coordinator.suspend("t1", Some("batch-b".to_string())).await.unwrap();
        coordinator.activate("t1", Some("batch-a".to_string())).await.unwrap();

        let tenant = coordinator.storage.get_tenant("t1").await.unwrap().unwrap();
        match tenant.suspended_batches {
            SuspendedBatches::Tags(tags) => {
                assert!(!tags.contains("batch-a"));
                assert!(tags.contains("batch-b"));
            }
            other => panic!("expected Tags, got {other:?}"),
        }
    }
}

