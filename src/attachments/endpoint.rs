//! Fetches attachment bytes from a tenant's attachment-service endpoint.
//! Unlike `FetchMode::HttpUrl`, `storage_path` here is not a URL at all —
//! it's an opaque parameter string the tenant's endpoint interprets,
//! POSTed as the request body against the tenant's configured attachment
//! endpoint (base URL + attachment path).

use crate::error::{RelayError, RelayResult};
use crate::types::{Auth, Tenant};
use url::Url;

pub struct EndpointFetcher {
    client: reqwest::Client,
}

impl EndpointFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn fetch(&self, tenant: &Tenant, parameter: &str, auth: Option<&Auth>) -> RelayResult<bytes::Bytes> {
        let url = endpoint_url(tenant)?;

        let mut request = self.client.post(&url).body(parameter.to_string());
        request = apply_auth(request, auth);

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::attachment_resolve(format!("endpoint fetch {url}: {e}")))?;

        if !response.status().is_success() {
            return Err(RelayError::attachment_resolve(format!(
                "endpoint fetch {url}: http {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| RelayError::attachment_resolve(format!("read endpoint body {url}: {e}")))
    }
}

pub(crate) fn apply_auth(request: reqwest::RequestBuilder, auth: Option<&Auth>) -> reqwest::RequestBuilder {
    match auth {
        None | Some(Auth::None) => request,
        Some(Auth::Bearer { token }) => request.bearer_auth(token),
        Some(Auth::Basic { username, password }) => request.basic_auth(username, Some(password)),
    }
}

/// Joins a tenant's attachment endpoint base URL and path. The attachment
/// id/parameters travel in the POST body, not the URL, so this is a plain
/// base+path join rather than a per-attachment URL.
fn endpoint_url(tenant: &Tenant) -> RelayResult<String> {
    let base = tenant.attachment_endpoint_base_url.as_deref().ok_or_else(|| {
        RelayError::attachment_resolve(format!("tenant {} has no attachment endpoint configured", tenant.id))
    })?;
    Url::parse(base)
        .map_err(|e| RelayError::attachment_resolve(format!("invalid attachment endpoint base url {base}: {e}")))?;
    let path = tenant.attachment_endpoint_path.as_deref().unwrap_or("");

    Ok(format!("{}{}", base.trim_end_matches('/'), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SuspendedBatches;

    fn tenant(base: Option<&str>, path: Option<&str>) -> Tenant {
        Tenant {
            id: "t1".to_string(),
            display_name: "Tenant One".to_string(),
            report_sink_base_url: "https://reports.example.com".to_string(),
            report_sink_path: "/v1/reports".to_string(),
            attachment_endpoint_base_url: base.map(str::to_string),
            attachment_endpoint_path: path.map(str::to_string),
            outbound_auth: Auth::None,
            active: true,
            suspended_batches: SuspendedBatches::None,
            retention_override: None,
        }
    }

    #[test]
    fn builds_base_plus_path_url() {
        let t = tenant(Some("https://attach.example.com"), Some("/v1/blobs"));
        let url = endpoint_url(&t).unwrap();
        assert_eq!(url, "https://attach.example.com/v1/blobs");
    }

    #[test]
    fn missing_endpoint_base_url_errors() {
        let t = tenant(None, None);
        assert!(endpoint_url(&t).is_err());
    }

    #[test]
    fn invalid_base_url_errors() {
        let t = tenant(Some("not-a-url"), None);
        assert!(endpoint_url(&t).is_err());
    }
}
