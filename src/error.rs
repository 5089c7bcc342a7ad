//! Crate-wide error type for the relay core.

/// Result type alias used throughout the relay core.
pub type RelayResult<T> = Result<T, RelayError>;

/// Error taxonomy for the relay core.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Submission-time validation failure, recovered per-id by the caller.
    #[error("validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// The storage adapter could not be reached; the caller's loop sleeps
    /// and retries on the next tick.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A storage-level constraint violation (e.g. duplicate id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An attachment could not be materialized; treated as transient for
    /// the owning message.
    #[error("attachment resolve error: {0}")]
    AttachmentResolve(String),

    /// A transient SMTP failure (4xx, connect/IO/timeout).
    #[error("transient SMTP failure: {0}")]
    SmtpTransient(String),

    /// A permanent SMTP failure (5xx except transient-by-policy codes, auth, TLS).
    #[error("permanent SMTP failure: {0}")]
    SmtpPermanent(String),

    /// Rate limiter decided to defer the message until `retry_after`.
    #[error("rate limited, retry after {retry_after}")]
    RateLimitedDefer { retry_after: chrono::DateTime<chrono::Utc> },

    /// Rate limiter decided to reject the message outright (account policy = reject).
    #[error("rate limited, account policy rejects: {0}")]
    RateLimitedReject(String),

    /// The tenant's report sink could not be reached or did not return 2xx;
    /// the batch is retried on the next report-loop tick.
    #[error("report sink unavailable: {0}")]
    ReportSinkUnavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("smtp transport error: {0}")]
    SmtpTransport(#[from] lettre::transport::smtp::Error),

    #[error("smtp address error: {0}")]
    SmtpAddress(#[from] lettre::address::AddressError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("not found: {resource} {id}")]
    NotFound { resource: String, id: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation { field: field.into(), message: message.into() }
    }

    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn attachment_resolve(message: impl Into<String>) -> Self {
        Self::AttachmentResolve(message.into())
    }

    pub fn not_found(resource: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into(), id: id.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether a loop should retry this error on its next tick rather than
    /// surfacing it further. Per-message and per-batch errors never bubble
    /// past their worker/loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::StorageUnavailable(_)
                | RelayError::AttachmentResolve(_)
                | RelayError::SmtpTransient(_)
                | RelayError::RateLimitedDefer { .. }
                | RelayError::ReportSinkUnavailable(_)
                | RelayError::Http(_)
                | RelayError::Database(_)
        )
    }

    /// Category tag used in log fields.
    pub fn category(&self) -> &'static str {
        match self {
            RelayError::Validation { .. } => "validation",
            RelayError::StorageUnavailable(_) => "storage_unavailable",
            RelayError::Conflict(_) => "conflict",
            RelayError::AttachmentResolve(_) => "attachment",
            RelayError::SmtpTransient(_) => "smtp_transient",
            RelayError::SmtpPermanent(_) => "smtp_permanent",
            RelayError::RateLimitedDefer { .. } => "rate_limited_defer",
            RelayError::RateLimitedReject(_) => "rate_limited_reject",
            RelayError::ReportSinkUnavailable(_) => "report_sink_unavailable",
            RelayError::Database(_) => "database",
            RelayError::Http(_) => "http",
            RelayError::SmtpTransport(_) => "smtp_transport",
            RelayError::SmtpAddress(_) => "smtp_address",
            RelayError::Json(_) => "json",
            RelayError::Io(_) => "io",
            RelayError::Configuration(_) => "configuration",
            RelayError::NotFound { .. } => "not_found",
            RelayError::Internal(_) => "internal",
        }
    }
}
