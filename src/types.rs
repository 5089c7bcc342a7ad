//! Core data model: Message, Account, Tenant, send-log and attachment types.
//!
//! Plain serde structs throughout: `Uuid` surrogate keys, `chrono::DateTime<Utc>`
//! timestamps, and enums that round-trip as lowercase snake_case over the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Priority class: 0 immediate, 1 high, 2 medium, 3 low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Immediate = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentType {
    Plain,
    Html,
}

impl Default for ContentType {
    fn default() -> Self {
        ContentType::Plain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsMode {
    None,
    Starttls,
    Implicit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverLimitPolicy {
    Defer,
    Reject,
}

/// How to fetch an attachment's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Base64,
    Filesystem,
    HttpUrl,
    Endpoint,
}

impl FetchMode {
    /// Infer a fetch mode from `storage_path` when the descriptor omits it.
    pub fn infer(storage_path: &str) -> FetchMode {
        if storage_path.starts_with("base64:") {
            FetchMode::Base64
        } else if storage_path.starts_with("http://") || storage_path.starts_with("https://") {
            FetchMode::HttpUrl
        } else if storage_path.starts_with('/') {
            FetchMode::Filesystem
        } else {
            FetchMode::Endpoint
        }
    }
}

/// Outbound authentication descriptor for a tenant (or attachment override).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Auth {
    None,
    Bearer { token: String },
    Basic { username: String, password: String },
}

impl Default for Auth {
    fn default() -> Self {
        Auth::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub filename: String,
    pub mime_type: Option<String>,
    pub fetch_mode: FetchMode,
    pub storage_path: String,
    pub content_hash: Option<String>,
    pub auth: Option<Auth>,
}

/// Suspended-batches set for a tenant: either everything, or a named set of
/// batch tags. An empty set means "not suspended".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum SuspendedBatches {
    #[default]
    None,
    All,
    Tags(std::collections::HashSet<String>),
}

impl SuspendedBatches {
    pub fn suspends(&self, batch_code: Option<&str>) -> bool {
        match self {
            SuspendedBatches::None => false,
            SuspendedBatches::All => true,
            SuspendedBatches::Tags(tags) => {
                batch_code.map(|b| tags.contains(b)).unwrap_or(false)
            }
        }
    }

    pub fn is_suspended_at_all(&self) -> bool {
        !matches!(self, SuspendedBatches::None)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub display_name: String,
    pub report_sink_base_url: String,
    pub report_sink_path: String,
    pub attachment_endpoint_base_url: Option<String>,
    pub attachment_endpoint_path: Option<String>,
    pub outbound_auth: Auth,
    pub active: bool,
    pub suspended_batches: SuspendedBatches,
    pub retention_override: Option<chrono::Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindowLimits {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
    pub per_day: Option<u32>,
}

impl RateWindowLimits {
    pub fn unbounded() -> Self {
        Self { per_minute: None, per_hour: None, per_day: None }
    }

    pub fn is_unbounded(&self) -> bool {
        self.per_minute.is_none() && self.per_hour.is_none() && self.per_day.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub tenant_id: Option<String>,
    pub host: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    pub username: Option<String>,
    /// Opaque encrypted blob; decryption at rest is an external collaborator's
    /// responsibility. The core only ever forwards this
    /// string to the configured credential resolver, so it's held as a
    /// `SecretString` to keep it out of `Debug`/log output. `secrecy` only
    /// implements `Deserialize`, not `Serialize` (by design), so this field
    /// is excluded from serialization.
    #[serde(skip_serializing, default)]
    pub encrypted_password: Option<secrecy::SecretString>,
    pub limits: RateWindowLimits,
    pub over_limit_policy: OverLimitPolicy,
    pub batch_size_hint: Option<usize>,
    pub connection_ttl_hint: Option<chrono::Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagePayload {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub content_type: ContentType,
    pub body: String,
    pub body_alt: Option<String>,
    pub headers: HashMap<String, String>,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub attachments: Vec<AttachmentDescriptor>,
}

/// The queue element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Stable client-supplied identifier, unique within its tenant scope.
    pub id: String,
    /// Internal surrogate key.
    pub pk: Uuid,
    pub tenant_id: Option<String>,
    pub account_id: String,
    pub priority: Priority,
    pub batch_code: Option<String>,
    pub deferred_ts: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub payload: MessagePayload,
    pub created_ts: DateTime<Utc>,
    pub sent_ts: Option<DateTime<Utc>>,
    pub error_ts: Option<DateTime<Utc>>,
    pub bounce_ts: Option<DateTime<Utc>>,
    pub reported_ts: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_terminal(&self) -> bool {
        self.sent_ts.is_some() || self.error_ts.is_some()
    }
}

/// One row per successful SMTP delivery. Append-only except for
/// retention-based truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendLogEntry {
    pub account_id: String,
    pub ts: DateTime<Utc>,
}

/// A resolved attachment ready to be embedded in a MIME message.
#[derive(Debug, Clone)]
pub struct ResolvedAttachment {
    pub filename: String,
    pub mime_type: mime::Mime,
    pub bytes: bytes::Bytes,
}

/// Wire-level submission payload accepted from the REST collaborator,
/// prior to normalization into a `Message`.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitMessage {
    pub id: String,
    pub from: String,
    pub to: StringOrList,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub reply_to: Option<String>,
    pub return_path: Option<String>,
    pub priority: Option<Priority>,
    pub deferred_ts: Option<DateTime<Utc>>,
    pub batch_code: Option<String>,
    pub account_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<SubmitAttachment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAttachment {
    pub filename: String,
    pub storage_path: String,
    pub fetch_mode: Option<FetchMode>,
    pub mime_type: Option<String>,
    pub auth: Option<Auth>,
}

/// Accepts either a comma-separated string or a JSON array for recipient lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    List(Vec<String>),
    Comma(String),
}

impl StringOrList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::List(v) => v,
            StringOrList::Comma(s) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedMessage {
    pub id: String,
    pub reason: String,
}
