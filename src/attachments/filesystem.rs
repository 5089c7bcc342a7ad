//! Local-filesystem attachment fetcher.
//!
//! `storage_path` is resolved relative to a configured base directory and
//! canonicalized before the read, so a descriptor cannot escape the base
//! directory with `..` segments or a symlink.

use crate::error::{RelayError, RelayResult};
use crate::types::Auth;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;

pub struct FilesystemFetcher {
    base_dir: PathBuf,
}

impl FilesystemFetcher {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn resolve(&self, storage_path: &str) -> RelayResult<PathBuf> {
        let relative = storage_path.trim_start_matches('/');
        let candidate = self.base_dir.join(relative);

        let base_canon = self
            .base_dir
            .canonicalize()
            .map_err(|e| RelayError::attachment_resolve(format!("base dir unavailable: {e}")))?;

        // The file may not exist yet at canonicalize time in rare races; canonicalize
        // what we can and check the parent if the leaf itself is missing.
        let canon = match candidate.canonicalize() {
            Ok(c) => c,
            Err(_) => {
                let parent = candidate
                    .parent()
                    .ok_or_else(|| RelayError::attachment_resolve("invalid attachment path"))?
                    .canonicalize()
                    .map_err(|e| RelayError::attachment_resolve(format!("{e}")))?;
                parent.join(candidate.file_name().unwrap_or_default())
            }
        };

        if !canon.starts_with(&base_canon) {
            return Err(RelayError::attachment_resolve("attachment path escapes base directory"));
        }

        Ok(canon)
    }
}

#[async_trait]
impl super::AttachmentFetcher for FilesystemFetcher {
    async fn fetch(&self, storage_path: &str, _auth: Option<&Auth>) -> RelayResult<Bytes> {
        let path = self.resolve(storage_path)?;
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| RelayError::attachment_resolve(format!("{}: {e}", path.display())))?;
        Ok(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::AttachmentFetcher;

    #[tokio::test]
    async fn reads_file_within_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("a.txt"), b"hi").await.unwrap();
        let fetcher = FilesystemFetcher::new(dir.path().to_path_buf());
        let bytes = fetcher.fetch("a.txt", None).await.unwrap();
        assert_eq!(bytes.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn rejects_path_escaping_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        tokio::fs::write(outside.path().join("secret.txt"), b"nope").await.unwrap();
        let fetcher = FilesystemFetcher::new(dir.path().to_path_buf());
        let escape_path = format!("../{}/secret.txt", outside.path().file_name().unwrap().to_string_lossy());
        let result = fetcher.fetch(&escape_path, None).await;
        assert!(result.is_err());
    }
}
