use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use leasewatch_model::{Credential, DiscoveredWatch, WatchKind, WatchRecord};
use tracing::debug;

use crate::{
    error::Result,
    poller::UpsertCounts,
    rate_limit::{PermitOutcome, RateLimiter},
    store::LeaseStore,
    time::{TimeProvider, to_chrono},
    upstream::UpstreamClient,
};

/// Label attached to encounter watches.
pub const ENCOUNTER_LABEL: &str = "encounter";
/// Label for documents without a type tag.
pub const UNCLASSIFIED_LABEL: &str = "unclassified";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification {
    Ready(String),
    /// No rate-limit permit this cycle. The record is released and retried.
    Deferred,
}

#[async_trait]
pub trait RecordClassifier: Send + Sync {
    async fn classify(
        &self,
        record: &WatchRecord,
        credential: &Credential,
    ) -> Result<Classification>;
}

/// Normalised document type label: trimmed, lower case, `unclassified` when
/// missing or blank.
pub fn document_label(document_type: Option<&str>) -> String {
    match document_type.map(str::trim) {
        Some(tag) if !tag.is_empty() => tag.to_lowercase(),
        _ => UNCLASSIFIED_LABEL.to_string(),
    }
}

/// Classifier backed by the upstream API. Encounters expand into document
/// watches; documents are labelled by their type tag.
#[derive(Clone)]
pub struct UpstreamClassifier {
    store: Arc<dyn LeaseStore>,
    upstream: Arc<dyn UpstreamClient>,
    limiter: RateLimiter,
    time: Arc<dyn TimeProvider>,
    watch_ttl: Duration,
}

impl std::fmt::Debug for UpstreamClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClassifier")
            .field("watch_ttl", &self.watch_ttl)
            .finish_non_exhaustive()
    }
}

impl UpstreamClassifier {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        upstream: Arc<dyn UpstreamClient>,
        limiter: RateLimiter,
        time: Arc<dyn TimeProvider>,
        watch_ttl: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            limiter,
            time,
            watch_ttl,
        }
    }

    async fn expand_encounter(
        &self,
        record: &WatchRecord,
        credential: &Credential,
    ) -> Result<Classification> {
        if let PermitOutcome::Deferred { .. } =
            self.limiter.acquire(&record.tenant_id).await?
        {
            return Ok(Classification::Deferred);
        }

        let documents = self
            .upstream
            .list_documents(credential, &record.record_id)
            .await?;
        let ttl = to_chrono(self.watch_ttl);
        let mut upserts = UpsertCounts::default();
        for document in documents {
            let watch = DiscoveredWatch {
                tenant_id: record.tenant_id.clone(),
                kind: WatchKind::Document,
                record_id: document.id,
                modified_at: document.modified_at,
                document_type: document.document_type,
                parent_id: Some(record.record_id.clone()),
            };
            upserts.record(
                self.store
                    .upsert_watch(&watch, self.time.utc_now(), ttl)
                    .await?,
            );
        }

        debug!(
            target: "leasewatch::dispatch",
            tenant = %record.tenant_id,
            record = %record.record_id,
            documents = upserts.total(),
            created = upserts.created,
            "expanded encounter into document watches"
        );
        Ok(Classification::Ready(ENCOUNTER_LABEL.to_string()))
    }
}

#[async_trait]
impl RecordClassifier for UpstreamClassifier {
    async fn classify(
        &self,
        record: &WatchRecord,
        credential: &Credential,
    ) -> Result<Classification> {
        match record.kind {
            WatchKind::Encounter => self.expand_encounter(record, credential).await,
            WatchKind::Document => Ok(Classification::Ready(document_label(
                record.document_type.as_deref(),
            ))),
        }
    }
}
