//! Attachment resolution: turning an `AttachmentDescriptor` into bytes
//! ready for MIME composition.
//!
//! One `#[async_trait]` capability trait with a single `fetch` method,
//! implemented once per `FetchMode`, dispatched through a shared resolver.

pub mod base64_mode;
pub mod endpoint;
pub mod filesystem;
pub mod http;

use crate::cache::AttachmentCache;
use crate::error::{RelayError, RelayResult};
use crate::types::{Auth, FetchMode, ResolvedAttachment};
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// One fetch strategy, keyed by `FetchMode`.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    async fn fetch(&self, storage_path: &str, auth: Option<&Auth>) -> RelayResult<Bytes>;
}

/// Dispatches to the fetcher for a descriptor's mode, through the shared
/// cache, bounding concurrent in-flight resolutions. The crate-wide
/// semaphore lives here so a single huge message can't starve the rest
/// of a dispatch batch.
pub struct AttachmentResolver {
    base64: base64_mode::Base64Fetcher,
    filesystem: filesystem::FilesystemFetcher,
    http_url: http::HttpFetcher,
    endpoint: endpoint::EndpointFetcher,
    cache: Arc<AttachmentCache>,
    concurrency: Arc<Semaphore>,
}

impl AttachmentResolver {
    pub fn new(
        filesystem_base_dir: std::path::PathBuf,
        http_client: reqwest::Client,
        cache: Arc<AttachmentCache>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            base64: base64_mode::Base64Fetcher,
            filesystem: filesystem::FilesystemFetcher::new(filesystem_base_dir),
            http_url: http::HttpFetcher::new(http_client.clone()),
            endpoint: endpoint::EndpointFetcher::new(http_client),
            cache,
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub async fn resolve(
        &self,
        descriptor: &crate::types::AttachmentDescriptor,
        tenant: Option<&crate::types::Tenant>,
    ) -> RelayResult<ResolvedAttachment> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| RelayError::internal("attachment semaphore closed"))?;

        let mode = descriptor.fetch_mode;
        let storage_path = descriptor.storage_path.clone();
        // A descriptor-level auth override wins; otherwise fall back to the
        // tenant's outbound auth, same as the report sink push does.
        let auth = descriptor.auth.clone().or_else(|| tenant.map(|t| t.outbound_auth.clone()));

        let cache_key = cache_key_for(descriptor, tenant);

        let fetcher_result: RelayResult<Bytes> = match mode {
            FetchMode::Base64 => self.base64.fetch(&storage_path, auth.as_ref()).await,
            FetchMode::Filesystem => {
                self.cache
                    .get_or_fetch(&cache_key, || async { self.filesystem.fetch(&storage_path, auth.as_ref()).await })
                    .await
            }
            FetchMode::HttpUrl => {
                self.cache
                    .get_or_fetch(&cache_key, || async { self.http_url.fetch(&storage_path, auth.as_ref()).await })
                    .await
            }
            FetchMode::Endpoint => {
                let tenant = tenant
                    .ok_or_else(|| RelayError::attachment_resolve("endpoint fetch requires a tenant"))?;
                self.cache
                    .get_or_fetch(&cache_key, || async { self.endpoint.fetch(tenant, &storage_path, auth.as_ref()).await })
                    .await
            }
        };

        let bytes = fetcher_result?;

        if let Some(expected) = &descriptor.content_hash {
            let actual = content_hash_hex(&bytes, expected.len());
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(RelayError::attachment_resolve(format!(
                    "content hash mismatch for {}: expected {expected}, got {actual}",
                    descriptor.filename
                )));
            }
        }

        let mime_type = resolve_mime_type(descriptor);
        let filename = strip_hash_marker(&descriptor.filename);

        Ok(ResolvedAttachment { filename, mime_type, bytes })
    }
}

/// Cache key for a descriptor's fetched bytes. A content hash, when given,
/// identifies the bytes uniquely on its own. Otherwise the key falls back
/// to mode+storage_path, but storage_path is only unique within a tenant's
/// own endpoint/filesystem namespace, so the tenant id must be folded in
/// too — without it, two tenants sharing a storage_path string would read
/// back each other's cached bytes.
fn cache_key_for(descriptor: &crate::types::AttachmentDescriptor, tenant: Option<&crate::types::Tenant>) -> String {
    descriptor.content_hash.clone().unwrap_or_else(|| {
        let tenant_id = tenant.map(|t| t.id.as_str()).unwrap_or("");
        format!("{tenant_id}:{:?}:{}", descriptor.fetch_mode, descriptor.storage_path)
    })
}

/// Resolution order: descriptor-provided mime type, then extension-based
/// guess, then `application/octet-stream`.
fn resolve_mime_type(descriptor: &crate::types::AttachmentDescriptor) -> mime::Mime {
    if let Some(declared) = &descriptor.mime_type {
        if let Ok(parsed) = declared.parse() {
            return parsed;
        }
    }
    mime_guess::from_path(&descriptor.filename).first_or_octet_stream()
}

static HASH_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"_\{(?:MD5|SHA256):[0-9a-fA-F]+\}").unwrap());

/// Strips a trailing `_{MD5:hex}` / `_{SHA256:hex}` hash marker some
/// upstream producers embed in the filename before it was content-hashed.
fn strip_hash_marker(filename: &str) -> String {
    HASH_MARKER.replace(filename, "").to_string()
}

/// Hashes `bytes` with MD5 or SHA-256 depending on the expected digest's
/// hex length, so a descriptor produced by either convention verifies.
fn content_hash_hex(bytes: &Bytes, expected_hex_len: usize) -> String {
    use sha2::{Digest, Sha256};
    if expected_hex_len == 32 {
        format!("{:x}", md5::compute(bytes))
    } else {
        hex::encode(Sha256::digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttachmentDescriptor;

    fn tenant(id: &str) -> crate::types::Tenant {
        crate::types::Tenant {
            id: id.to_string(),
            display_name: id.to_string(),
            report_sink_base_url: "https://example.com".to_string(),
            report_sink_path: "/reports".to_string(),
            attachment_endpoint_base_url: Some("https://example.com".to_string()),
            attachment_endpoint_path: Some("/attachments".to_string()),
            outbound_auth: crate::types::Auth::None,
            active: true,
            suspended_batches: crate::types::SuspendedBatches::None,
            retention_override: None,
        }
    }

    #[test]
    fn cache_key_distinguishes_tenants_sharing_a_storage_path() {
        let descriptor = AttachmentDescriptor {
            filename: "invoice.pdf".to_string(),
            mime_type: None,
            fetch_mode: FetchMode::Endpoint,
            storage_path: "invoice-1001".to_string(),
            content_hash: None,
            auth: None,
        };
        let key_a = cache_key_for(&descriptor, Some(&tenant("tenant-a")));
        let key_b = cache_key_for(&descriptor, Some(&tenant("tenant-b")));
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn cache_key_is_stable_for_same_tenant_and_descriptor() {
        let descriptor = AttachmentDescriptor {
            filename: "invoice.pdf".to_string(),
            mime_type: None,
            fetch_mode: FetchMode::Endpoint,
            storage_path: "invoice-1001".to_string(),
            content_hash: None,
            auth: None,
        };
        let tenant = tenant("tenant-a");
        assert_eq!(cache_key_for(&descriptor, Some(&tenant)), cache_key_for(&descriptor, Some(&tenant)));
    }

    #[test]
    fn content_hash_takes_precedence_over_tenant_scoping() {
        let descriptor = AttachmentDescriptor {
            filename: "invoice.pdf".to_string(),
            mime_type: None,
            fetch_mode: FetchMode::Endpoint,
            storage_path: "invoice-1001".to_string(),
            content_hash: Some("deadbeef".to_string()),
            auth: None,
        };
        assert_eq!(cache_key_for(&descriptor, Some(&tenant("tenant-a"))), "deadbeef");
        assert_eq!(cache_key_for(&descriptor, Some(&tenant("tenant-b"))), "deadbeef");
    }

    #[test]
    fn strips_hash_marker() {
        assert_eq!(strip_hash_marker("report_{MD5:deadbeef}.pdf"), "report.pdf");
        assert_eq!(strip_hash_marker("plain.pdf"), "plain.pdf");
    }

    #[test]
    fn mime_resolution_prefers_descriptor() {
        let descriptor = AttachmentDescriptor {
            filename: "a.bin".to_string(),
            mime_type: Some("application/pdf".to_string()),
            fetch_mode: FetchMode::Base64,
            storage_path: "base64:AAAA".to_string(),
            content_hash: None,
            auth: None,
        };
        assert_eq!(resolve_mime_type(&descriptor).essence_str(), "application/pdf");
    }

    #[test]
    fn mime_resolution_falls_back_to_extension_then_octet_stream() {
        let mut descriptor = AttachmentDescriptor {
            filename: "a.png".to_string(),
            mime_type: None,
            fetch_mode: FetchMode::Base64,
            storage_path: "base64:AAAA".to_string(),
            content_hash: None,
            auth: None,
        };
        assert_eq!(resolve_mime_type(&descriptor).essence_str(), "image/png");
        descriptor.filename = "a.unknownext".to_string();
        assert_eq!(resolve_mime_type(&descriptor).essence_str(), "application/octet-stream");
    }
}
