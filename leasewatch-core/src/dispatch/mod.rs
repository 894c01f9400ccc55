//! Fan-out of claimed records to classification and the downstream queue.
//!
//! Workers are bounded twice: a global semaphore shared by every dispatch
//! call on this dispatcher, and a per-tenant semaphore per call so one busy
//! tenant cannot take every slot. A failed record keeps its lease; the lease
//! runs out and a later claim retries it.

use std::{collections::HashMap, sync::Arc};

use leasewatch_model::{Credential, DispatchMessage, TenantId, WatchRecord, WorkerId};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, warn};

use crate::{error::PollError, lease::LeaseManager};

pub mod classify;
pub mod downstream;

pub use classify::{Classification, RecordClassifier, UpstreamClassifier};
#[cfg(feature = "redis")]
pub use downstream::RedisDownstreamQueue;
pub use downstream::{ChannelDownstreamQueue, DownstreamQueue, LogDownstreamQueue};

/// What happened to one claimed record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Dispatched,
    /// Released without processing; retried on a later claim.
    Deferred,
    /// Left claimed until the lease expires.
    Failed { kind: &'static str },
    /// Published, but the lease had already passed to another owner.
    LeaseLost,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatched: usize,
    pub deferred: usize,
    pub failed: usize,
    pub lease_lost: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Dispatched => self.dispatched += 1,
            RecordOutcome::Deferred => self.deferred += 1,
            RecordOutcome::Failed { .. } => self.failed += 1,
            RecordOutcome::LeaseLost => self.lease_lost += 1,
        }
    }

    pub fn merge(&mut self, other: DispatchSummary) {
        self.dispatched += other.dispatched;
        self.deferred += other.deferred;
        self.failed += other.failed;
        self.lease_lost += other.lease_lost;
    }
}

struct Worker {
    leases: LeaseManager,
    classifier: Arc<dyn RecordClassifier>,
    queue: Arc<dyn DownstreamQueue>,
}

impl Worker {
    async fn process(
        &self,
        owner: &WorkerId,
        record: WatchRecord,
        credential: Option<Credential>,
    ) -> RecordOutcome {
        let key = record.key();

        let Some(credential) = credential else {
            debug!(
                target: "leasewatch::dispatch",
                tenant = %record.tenant_id,
                record = %record.record_id,
                "no fresh credential this cycle; releasing"
            );
            return self.release(&record, owner).await;
        };

        let label = match self.classifier.classify(&record, &credential).await {
            Ok(Classification::Ready(label)) => label,
            Ok(Classification::Deferred) => return self.release(&record, owner).await,
            Err(err) => return failed(&record, &err, "classification failed"),
        };

        let message = DispatchMessage::for_record(&record, label);
        if let Err(err) = self.queue.publish(&message).await {
            return failed(&record, &err, "downstream publish failed");
        }

        match self
            .leases
            .complete(&key, owner, record.source_modified_at)
            .await
        {
            Ok(true) => RecordOutcome::Dispatched,
            Ok(false) => {
                warn!(
                    target: "leasewatch::dispatch",
                    tenant = %record.tenant_id,
                    record = %record.record_id,
                    kind = %record.kind,
                    "lease passed to another owner before completion"
                );
                RecordOutcome::LeaseLost
            }
            Err(err) => failed(&record, &err, "completion write failed"),
        }
    }

    async fn release(&self, record: &WatchRecord, owner: &WorkerId) -> RecordOutcome {
        if let Err(err) = self.leases.release(&record.key(), owner).await {
            // The lease still expires on its own.
            debug!(
                target: "leasewatch::dispatch",
                record = %record.record_id,
                error.kind = err.kind(),
                "release failed"
            );
        }
        RecordOutcome::Deferred
    }
}

fn failed(record: &WatchRecord, err: &PollError, message: &str) -> RecordOutcome {
    warn!(
        target: "leasewatch::dispatch",
        tenant = %record.tenant_id,
        record = %record.record_id,
        kind = %record.kind,
        error.kind = err.kind(),
        error = %err,
        "{message}; lease left to expire"
    );
    RecordOutcome::Failed { kind: err.kind() }
}

#[derive(Clone)]
pub struct FanOutDispatcher {
    worker: Arc<Worker>,
    global: Arc<Semaphore>,
    per_tenant: usize,
}

impl std::fmt::Debug for FanOutDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutDispatcher")
            .field("global_available", &self.global.available_permits())
            .field("per_tenant", &self.per_tenant)
            .finish_non_exhaustive()
    }
}

impl FanOutDispatcher {
    pub fn new(
        leases: LeaseManager,
        classifier: Arc<dyn RecordClassifier>,
        queue: Arc<dyn DownstreamQueue>,
        global_concurrency: usize,
        per_tenant_concurrency: usize,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                leases,
                classifier,
                queue,
            }),
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            per_tenant: per_tenant_concurrency.max(1),
        }
    }

    /// Process every claimed record concurrently. Records whose tenant has no
    /// entry in `credentials` are released.
    pub async fn dispatch(
        &self,
        owner: &WorkerId,
        records: Vec<WatchRecord>,
        credentials: &HashMap<TenantId, Credential>,
    ) -> DispatchSummary {
        let mut tenant_limits: HashMap<TenantId, Arc<Semaphore>> = HashMap::new();
        let mut tasks = JoinSet::new();

        for record in records {
            let tenant_limit = tenant_limits
                .entry(record.tenant_id.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_tenant)))
                .clone();
            let global = self.global.clone();
            let worker = self.worker.clone();
            let owner = owner.clone();
            let credential = credentials.get(&record.tenant_id).cloned();

            tasks.spawn(async move {
                // Acquisition fails only on a closed semaphore, and neither is
                // ever closed.
                let (Ok(_tenant_permit), Ok(_global_permit)) = (
                    tenant_limit.acquire_owned().await,
                    global.acquire_owned().await,
                ) else {
                    return RecordOutcome::Failed { kind: "dispatch_closed" };
                };
                worker.process(&owner, record, credential).await
            });
        }

        let mut summary = DispatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => summary.record(&outcome),
                Err(err) => {
                    warn!(
                        target: "leasewatch::dispatch",
                        error = %err,
                        "dispatch worker panicked; lease left to expire"
                    );
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use leasewatch_model::{DiscoveredWatch, RecordId, WatchKind};

    use super::*;
    use crate::{
        error::Result,
        store::{InMemoryLeaseStore, LeaseStore},
        time::VirtualTimeProvider,
    };

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap()
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn credential(tenant_id: &TenantId) -> Credential {
        Credential {
            tenant_id: tenant_id.clone(),
            access_token: leasewatch_model::SecretToken::new("live"),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// Tracks how many classifications run at once, overall and per tenant.
    #[derive(Default)]
    struct TrackingClassifier {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        per_tenant: Mutex<HashMap<TenantId, (usize, usize)>>,
        calls: AtomicUsize,
        defer: bool,
    }

    impl TrackingClassifier {
        fn deferring() -> Self {
            Self {
                defer: true,
                ..Self::default()
            }
        }

        fn tenant_peak(&self, tenant_id: &TenantId) -> usize {
            self.per_tenant
                .lock()
                .unwrap()
                .get(tenant_id)
                .map_or(0, |(_, peak)| *peak)
        }
    }

    #[async_trait]
    impl RecordClassifier for TrackingClassifier {
        async fn classify(
            &self,
            record: &WatchRecord,
            _credential: &Credential,
        ) -> Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            {
                let mut tenants = self.per_tenant.lock().unwrap();
                let (current, peak) = tenants.entry(record.tenant_id.clone()).or_default();
                *current += 1;
                *peak = (*peak).max(*current);
            }

            tokio::time::sleep(Duration::from_millis(10)).await;

            self.per_tenant
                .lock()
                .unwrap()
                .entry(record.tenant_id.clone())
                .or_default()
                .0 -= 1;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.defer {
                Ok(Classification::Deferred)
            } else {
                Ok(Classification::Ready(record.kind.as_str().to_string()))
            }
        }
    }

    struct Fixture {
        store: InMemoryLeaseStore,
        leases: LeaseManager,
        owner: WorkerId,
    }

    async fn claimed(tenants: &[(&str, usize)]) -> (Fixture, Vec<WatchRecord>) {
        let clock = VirtualTimeProvider::new_at(start());
        let store = InMemoryLeaseStore::new();
        for (tenant_id, count) in tenants {
            for n in 0..*count {
                let watch = DiscoveredWatch {
                    tenant_id: tenant(tenant_id),
                    kind: WatchKind::Encounter,
                    record_id: RecordId::new(format!("enc-{n}")).unwrap(),
                    modified_at: start(),
                    document_type: None,
                    parent_id: None,
                };
                store
                    .upsert_watch(&watch, start(), chrono::Duration::hours(24))
                    .await
                    .unwrap();
            }
        }

        let leases = LeaseManager::new(Arc::new(store.clone()), Arc::new(clock));
        let owner = WorkerId::from_raw("inv-a");
        let mut records = Vec::new();
        for (tenant_id, _) in tenants {
            records.extend(
                leases
                    .claim(
                        &owner,
                        &tenant(tenant_id),
                        WatchKind::Encounter,
                        100,
                        Duration::from_secs(30),
                    )
                    .await
                    .unwrap(),
            );
        }
        (
            Fixture {
                store,
                leases,
                owner,
            },
            records,
        )
    }

    #[tokio::test]
    async fn concurrency_stays_within_global_and_tenant_limits() {
        let (fx, records) = claimed(&[("firm-a", 6), ("firm-b", 6)]).await;
        assert_eq!(records.len(), 12);
        let classifier = Arc::new(TrackingClassifier::default());
        let (queue, mut rx) = ChannelDownstreamQueue::new();
        let dispatcher =
            FanOutDispatcher::new(fx.leases, classifier.clone(), Arc::new(queue), 3, 2);
        let credentials: HashMap<_, _> = [tenant("firm-a"), tenant("firm-b")]
            .into_iter()
            .map(|t| (t.clone(), credential(&t)))
            .collect();

        let summary = dispatcher.dispatch(&fx.owner, records, &credentials).await;

        assert_eq!(summary.dispatched, 12);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 12);
        let peak = classifier.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "global peak {peak}");
        assert!(peak >= 2, "records never overlapped");
        for firm in ["firm-a", "firm-b"] {
            let tenant_peak = classifier.tenant_peak(&tenant(firm));
            assert!(tenant_peak <= 2, "{firm} peak {tenant_peak}");
        }

        let mut published = 0;
        while rx.try_recv().is_ok() {
            published += 1;
        }
        assert_eq!(published, 12);
    }

    #[tokio::test]
    async fn one_tenant_alone_is_capped_by_its_own_limit() {
        let (fx, records) = claimed(&[("firm-a", 8)]).await;
        let classifier = Arc::new(TrackingClassifier::default());
        let dispatcher = FanOutDispatcher::new(
            fx.leases,
            classifier.clone(),
            Arc::new(LogDownstreamQueue),
            8,
            2,
        );
        let credentials = HashMap::from([(tenant("firm-a"), credential(&tenant("firm-a")))]);

        let summary = dispatcher.dispatch(&fx.owner, records, &credentials).await;

        assert_eq!(summary.dispatched, 8);
        assert_eq!(classifier.tenant_peak(&tenant("firm-a")), 2);
        assert!(classifier.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn deferred_classifications_release_the_lease() {
        let (fx, records) = claimed(&[("firm-a", 2)]).await;
        let keys: Vec<_> = records.iter().map(WatchRecord::key).collect();
        let dispatcher = FanOutDispatcher::new(
            fx.leases,
            Arc::new(TrackingClassifier::deferring()),
            Arc::new(LogDownstreamQueue),
            4,
            4,
        );
        let credentials = HashMap::from([(tenant("firm-a"), credential(&tenant("firm-a")))]);

        let summary = dispatcher.dispatch(&fx.owner, records, &credentials).await;

        assert_eq!(summary.deferred, 2);
        assert_eq!(summary.dispatched, 0);
        for key in keys {
            let record = fx.store.get_watch(&key).await.unwrap().unwrap();
            assert_eq!(record.lease_owner, None, "{key}");
            assert_eq!(record.dispatched_through, None);
        }
    }

    #[tokio::test]
    async fn records_without_a_credential_are_released_unclassified() {
        let (fx, records) = claimed(&[("firm-a", 1), ("firm-b", 2)]).await;
        let orphaned: Vec<_> = records
            .iter()
            .filter(|record| record.tenant_id == tenant("firm-b"))
            .map(WatchRecord::key)
            .collect();
        let classifier = Arc::new(TrackingClassifier::default());
        let dispatcher = FanOutDispatcher::new(
            fx.leases,
            classifier.clone(),
            Arc::new(LogDownstreamQueue),
            4,
            4,
        );
        let credentials = HashMap::from([(tenant("firm-a"), credential(&tenant("firm-a")))]);

        let summary = dispatcher.dispatch(&fx.owner, records, &credentials).await;

        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.deferred, 2);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        for key in orphaned {
            let record = fx.store.get_watch(&key).await.unwrap().unwrap();
            assert_eq!(record.lease_owner, None, "{key}");
        }
    }
}
