//! The report loop: pushes delivery reports for terminal, unreported
//! messages to each tenant's report sink.

use crate::error::RelayResult;
use crate::storage::StorageAdapter;
use crate::types::{Message, Tenant};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// One entry of the `delivery_report` array: `tenant_id`, `id`, `pk`
/// (surrogate key), plus exactly the subset of fields matching the
/// message's terminal event. `sent_ts` and `error_ts`/`error` are mutually
/// exclusive per message and both omitted entirely (not emitted as `null`)
/// when absent.
#[derive(Debug, Serialize)]
struct DeliveryReportItem {
    tenant_id: Option<String>,
    id: String,
    pk: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sent_ts: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_ts: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeliveryReportPayload<'a> {
    delivery_report: &'a [DeliveryReportItem],
}

impl From<&Message> for DeliveryReportItem {
    fn from(m: &Message) -> Self {
        DeliveryReportItem {
            tenant_id: m.tenant_id.clone(),
            id: m.id.clone(),
            pk: m.pk.to_string(),
            sent_ts: m.sent_ts,
            error_ts: m.error_ts,
            error: m.error_ts.and(m.last_error.clone()),
        }
    }
}

pub struct ReportLoop {
    storage: Arc<dyn StorageAdapter>,
    http_client: reqwest::Client,
    batch_size: usize,
    running: Arc<AtomicBool>,
}

impl ReportLoop {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        http_client: reqwest::Client,
        batch_size: usize,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self { storage, http_client, batch_size, running }
    }

    pub async fn run(&self, tick_interval: std::time::Duration) {
        let mut interval = tokio::time::interval(tick_interval);
        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            match self.tick().await {
                Ok(sent) => info!(batches = sent, "report tick complete"),
                Err(e) => warn!(error = %e, category = e.category(), "report tick failed"),
            }
        }
    }

    /// Returns the number of tenant batches successfully acknowledged.
    pub async fn tick(&self) -> RelayResult<usize> {
        let pending = self.storage.list_terminal_unreported(self.batch_size * 8, None).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut by_tenant: HashMap<Option<String>, Vec<Message>> = HashMap::new();
        for message in pending {
            by_tenant.entry(message.tenant_id.clone()).or_default().push(message);
        }

        let mut acked_batches = 0usize;
        for (tenant_id, mut messages) in by_tenant {
            let Some(tenant_id) = tenant_id else {
                // Messages with no tenant association have no report sink;
                // mark them reported locally so they don't block retention.
                let ids: Vec<_> = messages.drain(..).map(|m| (m.id, None)).collect();
                self.storage.mark_reported(&ids, Utc::now()).await?;
                continue;
            };

            let Some(tenant) = self.storage.get_tenant(&tenant_id).await? else {
                warn!(tenant_id = %tenant_id, "report batch for unknown tenant dropped");
                continue;
            };

            for chunk in messages.chunks(self.batch_size) {
                if self.push_batch(&tenant, chunk).await.is_ok() {
                    let ids: Vec<_> =
                        chunk.iter().map(|m| (m.id.clone(), m.tenant_id.clone())).collect();
                    self.storage.mark_reported(&ids, Utc::now()).await?;
                    acked_batches += 1;
                }
            }
        }

        Ok(acked_batches)
    }

    async fn push_batch(&self, tenant: &Tenant, messages: &[Message]) -> RelayResult<()> {
        let items: Vec<DeliveryReportItem> = messages.iter().map(DeliveryReportItem::from).collect();
        let payload = DeliveryReportPayload { delivery_report: &items };

        let url = format!(
            "{}{}",
            tenant.report_sink_base_url.trim_end_matches('/'),
            tenant.report_sink_path
        );

        let mut request = self.http_client.post(&url).json(&payload);
        request = crate::attachments::endpoint::apply_auth(request, Some(&tenant.outbound_auth));

        let response = request
            .send()
            .await
            .map_err(|e| crate::error::RelayError::ReportSinkUnavailable(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(crate::error::RelayError::ReportSinkUnavailable(format!(
                "{url}: http {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessagePayload, Priority};
    use uuid::Uuid;

    fn base_message() -> Message {
        Message {
            id: "M1".to_string(),
            pk: Uuid::new_v4(),
            tenant_id: Some("T1".to_string()),
            account_id: "A".to_string(),
            priority: Priority::Medium,
            batch_code: None,
            deferred_ts: Utc::now(),
            retry_count: 0,
            last_error: None,
            payload: MessagePayload::default(),
            created_ts: Utc::now(),
            sent_ts: None,
            error_ts: None,
            bounce_ts: None,
            reported_ts: None,
        }
    }

    #[test]
    fn sent_entry_omits_error_fields() {
        let mut message = base_message();
        message.sent_ts = Some(Utc::now());
        let item = DeliveryReportItem::from(&message);
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("sent_ts").is_some());
        assert!(json.get("error_ts").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["pk"], message.pk.to_string());
        assert_eq!(json["tenant_id"], "T1");
    }

    #[test]
    fn error_entry_omits_sent_field() {
        let mut message = base_message();
        message.error_ts = Some(Utc::now());
        message.last_error = Some("550 rejected".to_string());
        let item = DeliveryReportItem::from(&message);
        let json = serde_json::to_value(&item).unwrap();
        assert!(json.get("sent_ts").is_none());
        assert_eq!(json["error_ts"], item.error_ts.unwrap().to_rfc3339());
        assert_eq!(json["error"], "550 rejected");
    }

    #[test]
    fn tenant_less_message_serializes_null_tenant_id() {
        let mut message = base_message();
        message.tenant_id = None;
        message.sent_ts = Some(Utc::now());
        let item = DeliveryReportItem::from(&message);
        let json = serde_json::to_value(&item).unwrap();
        assert!(json["tenant_id"].is_null());
    }
}
