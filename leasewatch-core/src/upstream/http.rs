use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use leasewatch_model::{Credential, RecordId};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{
    ChangePage, DocumentRef, UpstreamClient, status_error, transport_error,
};
use crate::error::{PollError, Result};

/// Upstream client over HTTP with per-tenant bearer tokens.
///
/// * `GET {base}/resources?modified_after=..&page_size=..&page_token=..`
/// * `GET {base}/encounters/{id}/documents`
#[derive(Debug, Clone)]
pub struct HttpUpstreamClient {
    client: Client,
    base_url: Url,
}

#[derive(Deserialize)]
struct DocumentListing {
    items: Vec<DocumentRef>,
}

impl HttpUpstreamClient {
    pub fn new(base_url: Url, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PollError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                PollError::Config(format!(
                    "upstream base URL {} cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request
            .bearer_auth(credential.access_token.expose())
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(credential, status, body));
        }

        response.json::<T>().await.map_err(transport_error)
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn list_changes(
        &self,
        credential: &Credential,
        modified_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ChangePage> {
        let url = self.endpoint(&["resources"])?;
        let mut query: Vec<(&str, String)> = vec![("page_size", page_size.to_string())];
        if let Some(after) = modified_after {
            query.push((
                "modified_after",
                after.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
        }
        if let Some(token) = page_token {
            query.push(("page_token", token.to_string()));
        }

        debug!(
            target: "leasewatch::poll",
            tenant = %credential.tenant_id,
            page_token = page_token.unwrap_or(""),
            "listing upstream changes"
        );

        self.get_json(credential, self.client.get(url).query(&query))
            .await
    }

    async fn list_documents(
        &self,
        credential: &Credential,
        encounter_id: &RecordId,
    ) -> Result<Vec<DocumentRef>> {
        let url =
            self.endpoint(&["encounters", encounter_id.as_str(), "documents"])?;
        let listing: DocumentListing =
            self.get_json(credential, self.client.get(url)).await?;
        Ok(listing.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_extend_the_base_path() {
        let client = HttpUpstreamClient::new(
            Url::parse("https://api.example.test/v2/").unwrap(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.endpoint(&["encounters", "enc 1", "documents"]).unwrap().as_str(),
            "https://api.example.test/v2/encounters/enc%201/documents"
        );
        assert_eq!(
            client.endpoint(&["resources"]).unwrap().as_str(),
            "https://api.example.test/v2/resources"
        );
    }
}
