//! Consumed upstream resource API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasewatch_model::{Credential, RecordId};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{PollError, Result};

pub mod http;

pub use http::HttpUpstreamClient;

/// One changed resource in a change listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedResource {
    pub id: RecordId,
    pub modified_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    pub items: Vec<ChangedResource>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// A document attached to an encounter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub id: RecordId,
    #[serde(default)]
    pub document_type: Option<String>,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// One page of resources modified strictly after `modified_after`
    /// (everything when `None`).
    async fn list_changes(
        &self,
        credential: &Credential,
        modified_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ChangePage>;

    async fn list_documents(
        &self,
        credential: &Credential,
        encounter_id: &RecordId,
    ) -> Result<Vec<DocumentRef>>;
}

/// Map a non-success upstream status onto the error taxonomy.
pub(crate) fn status_error(
    credential: &Credential,
    status: StatusCode,
    body: String,
) -> PollError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        PollError::TransientUpstream(format!("upstream returned {status}"))
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        PollError::credential(
            &credential.tenant_id,
            format!("upstream rejected access token ({status})"),
        )
    } else {
        PollError::UpstreamRejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

/// Undecodable bodies are serialization failures; every other transport
/// failure (timeout, connect, reset) is retried next cycle.
pub(crate) fn transport_error(err: reqwest::Error) -> PollError {
    if err.is_decode() {
        PollError::Serialization(err.to_string())
    } else {
        PollError::TransientUpstream(err.to_string())
    }
}
