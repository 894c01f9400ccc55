//! Shared fixtures for core integration tests.
#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use leasewatch_config::Config;
use leasewatch_core::{
    credentials::{TokenEndpoint, TokenGrant},
    dispatch::{ChannelDownstreamQueue, Classification, RecordClassifier},
    error::{PollError, Result},
    orchestrator::{Collaborators, Orchestrator},
    store::{InMemoryLeaseStore, LeaseStore},
    time::VirtualTimeProvider,
    upstream::{ChangePage, ChangedResource, DocumentRef, UpstreamClient},
};
use leasewatch_model::{
    Credential, DispatchMessage, RecordId, SecretToken, Tenant, TenantId, WatchRecord,
};
use tokio::sync::mpsc;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap()
}

pub fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

pub fn record(id: &str) -> RecordId {
    RecordId::new(id).unwrap()
}

/// Credential with no known expiry, so the first cycle refreshes it.
pub fn stale_credential(tenant_id: &TenantId) -> Credential {
    Credential {
        tenant_id: tenant_id.clone(),
        access_token: SecretToken::new(format!("{tenant_id}-access-0")),
        refresh_token: Some(SecretToken::new(format!("{tenant_id}-refresh-0"))),
        expires_at: None,
    }
}

/// Small, fast defaults for orchestrated tests.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.schedule.invocation_deadline = Duration::from_secs(30);
    config.schedule.claim_wait = Duration::from_secs(20);
    config.schedule.max_claim_iterations = 3;
    config.lease.duration = Duration::from_secs(30);
    config.lease.batch_size = 50;
    config.poller.page_size = 10;
    config
}

/// In-memory upstream: per-tenant change feed and per-encounter documents.
#[derive(Debug, Default)]
pub struct StubUpstream {
    changes: Mutex<HashMap<TenantId, Vec<ChangedResource>>>,
    documents: Mutex<HashMap<RecordId, Vec<DocumentRef>>>,
    rejected: Mutex<HashSet<TenantId>>,
    change_calls: Mutex<HashMap<TenantId, usize>>,
    pub document_calls: AtomicUsize,
}

impl StubUpstream {
    pub fn push_change(&self, tenant_id: &TenantId, id: &str, modified_at: DateTime<Utc>) {
        self.changes
            .lock()
            .unwrap()
            .entry(tenant_id.clone())
            .or_default()
            .push(ChangedResource {
                id: record(id),
                modified_at,
            });
    }

    pub fn push_document(
        &self,
        encounter: &str,
        id: &str,
        document_type: Option<&str>,
        modified_at: DateTime<Utc>,
    ) {
        self.documents
            .lock()
            .unwrap()
            .entry(record(encounter))
            .or_default()
            .push(DocumentRef {
                id: record(id),
                document_type: document_type.map(str::to_string),
                modified_at,
            });
    }

    /// Answer this tenant's requests with 401.
    pub fn reject(&self, tenant_id: &TenantId) {
        self.rejected.lock().unwrap().insert(tenant_id.clone());
    }

    pub fn change_calls(&self, tenant_id: &TenantId) -> usize {
        self.change_calls
            .lock()
            .unwrap()
            .get(tenant_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UpstreamClient for StubUpstream {
    async fn list_changes(
        &self,
        credential: &Credential,
        modified_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ChangePage> {
        let tenant_id = &credential.tenant_id;
        *self
            .change_calls
            .lock()
            .unwrap()
            .entry(tenant_id.clone())
            .or_default() += 1;
        if self.rejected.lock().unwrap().contains(tenant_id) {
            return Err(PollError::credential(tenant_id, "upstream returned 401"));
        }

        let mut matching: Vec<ChangedResource> = self
            .changes
            .lock()
            .unwrap()
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|item| modified_after.is_none_or(|after| item.modified_at > after))
            .collect();
        matching.sort_by(|a, b| (a.modified_at, &a.id).cmp(&(b.modified_at, &b.id)));

        let offset: usize = page_token.map_or(0, |token| token.parse().unwrap());
        let end = (offset + page_size as usize).min(matching.len());
        Ok(ChangePage {
            items: matching[offset.min(end)..end].to_vec(),
            next_page_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn list_documents(
        &self,
        _credential: &Credential,
        encounter_id: &RecordId,
    ) -> Result<Vec<DocumentRef>> {
        self.document_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .documents
            .lock()
            .unwrap()
            .get(encounter_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Token endpoint that grants one hour tokens, except for tenants it was
/// told to refuse.
#[derive(Debug, Default)]
pub struct StubTokens {
    refused: Mutex<HashSet<TenantId>>,
    pub grants: AtomicUsize,
}

impl StubTokens {
    pub fn refuse(&self, tenant_id: &TenantId) {
        self.refused.lock().unwrap().insert(tenant_id.clone());
    }
}

#[async_trait]
impl TokenEndpoint for StubTokens {
    async fn refresh(
        &self,
        tenant_id: &TenantId,
        _refresh_token: &SecretToken,
    ) -> Result<TokenGrant> {
        if self.refused.lock().unwrap().contains(tenant_id) {
            return Err(PollError::credential(tenant_id, "invalid_grant"));
        }
        let n = self.grants.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TokenGrant {
            access_token: SecretToken::new(format!("{tenant_id}-access-{n}")),
            refresh_token: None,
            expires_in: Duration::from_secs(3600),
        })
    }
}

/// Classifier whose every call fails, leaving leases to expire.
#[derive(Debug, Default)]
pub struct FailingClassifier {
    pub calls: AtomicUsize,
}

#[async_trait]
impl RecordClassifier for FailingClassifier {
    async fn classify(
        &self,
        _record: &WatchRecord,
        _credential: &Credential,
    ) -> Result<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PollError::UpstreamRejected {
            status: 422,
            message: "unprocessable".into(),
        })
    }
}

/// Fully wired orchestrator over in-memory collaborators.
pub struct Harness {
    pub store: InMemoryLeaseStore,
    pub upstream: Arc<StubUpstream>,
    pub tokens: Arc<StubTokens>,
    pub clock: VirtualTimeProvider,
    pub orchestrator: Orchestrator,
    pub dispatched: mpsc::UnboundedReceiver<DispatchMessage>,
}

impl Harness {
    pub fn new(config: &Config) -> Self {
        Self::build(config, None)
    }

    pub fn with_classifier(config: &Config, classifier: Arc<dyn RecordClassifier>) -> Self {
        Self::build(config, Some(classifier))
    }

    fn build(config: &Config, classifier: Option<Arc<dyn RecordClassifier>>) -> Self {
        let store = InMemoryLeaseStore::new();
        let upstream = Arc::new(StubUpstream::default());
        let tokens = Arc::new(StubTokens::default());
        let clock = VirtualTimeProvider::new_at(t0());
        let (queue, dispatched) = ChannelDownstreamQueue::new();

        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                store: Arc::new(store.clone()),
                upstream: upstream.clone(),
                tokens: tokens.clone(),
                queue: Arc::new(queue),
                time: Arc::new(clock.clone()),
                classifier,
            },
        );

        Self {
            store,
            upstream,
            tokens,
            clock,
            orchestrator,
            dispatched,
        }
    }

    pub async fn register(&self, tenant_id: &TenantId) {
        self.store.insert_tenant(Tenant::new(tenant_id.clone())).await;
        self.store
            .put_credential(&stale_credential(tenant_id))
            .await
            .unwrap();
    }

    pub async fn cursor(&self, tenant_id: &TenantId) -> Option<DateTime<Utc>> {
        self.store
            .get_tenant(tenant_id)
            .await
            .unwrap()
            .and_then(|tenant| tenant.cursor)
    }

    pub fn drain_dispatched(&mut self) -> Vec<DispatchMessage> {
        let mut out = Vec::new();
        while let Ok(message) = self.dispatched.try_recv() {
            out.push(message);
        }
        out
    }
}
