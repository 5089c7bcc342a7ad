//! Fetches attachment bytes from an arbitrary `http(s)://` URL
//!.

use crate::error::{RelayError, RelayResult};
use crate::types::Auth;
use async_trait::async_trait;
use bytes::Bytes;

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl super::AttachmentFetcher for HttpFetcher {
    async fn fetch(&self, storage_path: &str, auth: Option<&Auth>) -> RelayResult<Bytes> {
        let mut request = self.client.get(storage_path);
        request = super::endpoint::apply_auth(request, auth);

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::attachment_resolve(format!("fetch {storage_path}: {e}")))?;

        if !response.status().is_success() {
            return Err(RelayError::attachment_resolve(format!(
                "fetch {storage_path}: http {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| RelayError::attachment_resolve(format!("read body {storage_path}: {e}")))
    }
}
