//! Inline `base64:` attachment payloads.

use crate::error::{RelayError, RelayResult};
use crate::types::Auth;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;

pub struct Base64Fetcher;

#[async_trait]
impl super::AttachmentFetcher for Base64Fetcher {
    async fn fetch(&self, storage_path: &str, _auth: Option<&Auth>) -> RelayResult<Bytes> {
        let payload = storage_path.strip_prefix("base64:").unwrap_or(storage_path);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|e| RelayError::attachment_resolve(format!("invalid base64 payload: {e}")))?;
        Ok(Bytes::from(decoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::AttachmentFetcher;

    #[tokio::test]
    async fn decodes_prefixed_payload() {
        let fetcher = Base64Fetcher;
        let bytes = fetcher.fetch("base64:aGVsbG8=", None).await.unwrap();
        assert_eq!(bytes.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn rejects_invalid_base64() {
        let fetcher = Base64Fetcher;
        assert!(fetcher.fetch("base64:not-valid-!!!", None).await.is_err());
    }
}
