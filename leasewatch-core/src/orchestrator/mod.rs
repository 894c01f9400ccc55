//! Top-level driver for one polling/dispatch invocation.
//!
//! An invocation walks an explicit phase sequence on a single task:
//!
//! ```text
//! Discover -> Refresh -> Poll -> Claim -> Dispatch -> Wait -> (Claim | Done)
//! ```
//!
//! Nothing survives between invocations except what is in the lease store,
//! and every invocation claims under a fresh [`WorkerId`]. Overlapping
//! invocations are expected and safe.

use std::{collections::HashMap, fmt, sync::Arc};

use futures::{StreamExt, stream};
use leasewatch_config::{Config, LeaseConfig, ScheduleConfig};
use leasewatch_model::{Credential, Tenant, TenantId, WatchKind, WatchRecord, WorkerId};
use tracing::{debug, error, instrument, warn};

use crate::{
    credentials::{CredentialRefresher, TokenEndpoint},
    discovery::TenantDiscovery,
    dispatch::{DownstreamQueue, FanOutDispatcher, RecordClassifier, UpstreamClassifier},
    error::{PollError, Result},
    lease::LeaseManager,
    poller::{ChangePoller, PollOutcome},
    rate_limit::RateLimiter,
    store::LeaseStore,
    time::TimeProvider,
    upstream::UpstreamClient,
};

pub mod report;
pub mod schedule;

pub use report::CycleReport;
pub use schedule::ScheduleRunner;

/// External collaborators an [`Orchestrator`] is wired with.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn LeaseStore>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub tokens: Arc<dyn TokenEndpoint>,
    pub queue: Arc<dyn DownstreamQueue>,
    pub time: Arc<dyn TimeProvider>,
    /// Defaults to [`UpstreamClassifier`].
    pub classifier: Option<Arc<dyn RecordClassifier>>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("time", &self.time)
            .field("custom_classifier", &self.classifier.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Discover,
    Refresh,
    Poll,
    Claim,
    Dispatch,
    Wait,
    Done,
}

/// Per-invocation scratch state. Dropped when the invocation ends.
struct CycleState {
    owner: WorkerId,
    /// Restricts the cycle to one tenant (manual re-poll).
    scope: Option<TenantId>,
    tenants: Vec<Tenant>,
    credentials: HashMap<TenantId, Credential>,
    claimed: Vec<WatchRecord>,
    iteration: u32,
}

pub struct Orchestrator {
    store: Arc<dyn LeaseStore>,
    time: Arc<dyn TimeProvider>,
    discovery: TenantDiscovery,
    refresher: CredentialRefresher,
    poller: ChangePoller,
    leases: LeaseManager,
    dispatcher: FanOutDispatcher,
    schedule: ScheduleConfig,
    lease: LeaseConfig,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("schedule", &self.schedule)
            .field("lease", &self.lease)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(config: &Config, parts: Collaborators) -> Self {
        let Collaborators {
            store,
            upstream,
            tokens,
            queue,
            time,
            classifier,
        } = parts;

        let limiter = RateLimiter::new(store.clone(), time.clone(), config.rate_limit.clone());
        let leases = LeaseManager::new(store.clone(), time.clone());
        let classifier = classifier.unwrap_or_else(|| {
            Arc::new(UpstreamClassifier::new(
                store.clone(),
                upstream.clone(),
                limiter.clone(),
                time.clone(),
                config.lease.watch_ttl,
            ))
        });

        Self {
            discovery: TenantDiscovery::new(store.clone()),
            refresher: CredentialRefresher::new(
                store.clone(),
                tokens,
                time.clone(),
                config.credentials.safety_margin,
            ),
            poller: ChangePoller::new(
                store.clone(),
                upstream,
                limiter,
                time.clone(),
                config.poller,
                config.lease.watch_ttl,
            ),
            dispatcher: FanOutDispatcher::new(
                leases.clone(),
                classifier,
                queue,
                config.dispatch.global_concurrency,
                config.dispatch.per_tenant_concurrency,
            ),
            leases,
            store,
            time,
            schedule: config.schedule,
            lease: config.lease,
        }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    /// One scheduled invocation across every active tenant.
    pub async fn run_invocation(&self) -> Result<CycleReport> {
        self.run_cycle(WorkerId::new(), None).await
    }

    /// Out-of-band cycle for a single tenant. `None` when the tenant is not
    /// registered. Safe to run alongside scheduled invocations.
    pub async fn repoll_tenant(&self, tenant_id: &TenantId) -> Result<Option<CycleReport>> {
        if self.store.get_tenant(tenant_id).await?.is_none() {
            return Ok(None);
        }
        self.run_cycle(WorkerId::with_prefix("repoll"), Some(tenant_id.clone()))
            .await
            .map(Some)
    }

    #[instrument(
        name = "cycle",
        skip_all,
        fields(invocation = %owner, scope = ?scope)
    )]
    async fn run_cycle(&self, owner: WorkerId, scope: Option<TenantId>) -> Result<CycleReport> {
        let started = self.time.utc_now();
        let mut report = CycleReport::new(&owner);
        let mut state = CycleState {
            owner,
            scope,
            tenants: Vec::new(),
            credentials: HashMap::new(),
            claimed: Vec::new(),
            iteration: 0,
        };

        let driven = tokio::time::timeout(
            self.schedule.invocation_deadline,
            self.drive(&mut state, &mut report),
        )
        .await;

        match driven {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(
                    target: "leasewatch::cycle",
                    invocation = %state.owner,
                    error.kind = err.kind(),
                    error = %err,
                    "invocation aborted"
                );
                return Err(err);
            }
            Err(_) => {
                report.timed_out = true;
                warn!(
                    target: "leasewatch::cycle",
                    invocation = %state.owner,
                    deadline = ?self.schedule.invocation_deadline,
                    "invocation deadline reached; outstanding leases will expire"
                );
            }
        }

        let elapsed = (self.time.utc_now() - started).to_std().unwrap_or_default();
        report.finish(elapsed);
        report.log();
        Ok(report)
    }

    async fn drive(&self, state: &mut CycleState, report: &mut CycleReport) -> Result<()> {
        let mut phase = Phase::Discover;
        loop {
            debug!(target: "leasewatch::cycle", ?phase, iteration = state.iteration, "phase");
            phase = match phase {
                Phase::Discover => {
                    state.tenants = self.discover(state.scope.as_ref()).await?;
                    if state.tenants.is_empty() {
                        Phase::Done
                    } else {
                        Phase::Refresh
                    }
                }
                Phase::Refresh => {
                    self.refresh_all(state, report).await;
                    if state.credentials.is_empty() {
                        Phase::Done
                    } else {
                        Phase::Poll
                    }
                }
                Phase::Poll => {
                    self.poll_all(state, report).await;
                    Phase::Claim
                }
                Phase::Claim => {
                    state.iteration += 1;
                    report.claim_iterations = state.iteration;
                    state.claimed = self.claim_all(state).await;
                    report.claimed += state.claimed.len();
                    if state.claimed.is_empty() {
                        Phase::Done
                    } else {
                        Phase::Dispatch
                    }
                }
                Phase::Dispatch => {
                    let records = std::mem::take(&mut state.claimed);
                    let summary = self
                        .dispatcher
                        .dispatch(&state.owner, records, &state.credentials)
                        .await;
                    report.record_dispatch(summary);
                    if state.iteration >= self.schedule.max_claim_iterations {
                        Phase::Done
                    } else {
                        Phase::Wait
                    }
                }
                Phase::Wait => {
                    self.time.sleep(self.schedule.claim_wait).await;
                    Phase::Claim
                }
                Phase::Done => break,
            };
        }

        if self.lease.sweep_on_cycle && state.scope.is_none() {
            match self.leases.sweep(self.time.utc_now()).await {
                Ok(summary) => report.record_sweep(summary),
                Err(err) => warn!(
                    target: "leasewatch::lease",
                    { error.kind = err.kind(), error = %err },
                    "sweep failed"
                ),
            }
        }
        Ok(())
    }

    async fn discover(&self, scope: Option<&TenantId>) -> Result<Vec<Tenant>> {
        match scope {
            None => self.discovery.active_tenants().await,
            Some(tenant_id) => Ok(self
                .store
                .get_tenant(tenant_id)
                .await?
                .filter(|tenant| tenant.active)
                .into_iter()
                .collect()),
        }
    }

    async fn refresh_all(&self, state: &mut CycleState, report: &mut CycleReport) {
        let concurrency = self.schedule.poll_concurrency.max(1);
        let tenant_ids: Vec<TenantId> = state
            .tenants
            .iter()
            .map(|tenant| tenant.tenant_id.clone())
            .collect();
        let results: Vec<(TenantId, Result<Credential>)> = stream::iter(tenant_ids)
            .map(|tenant_id| async move {
                let refreshed = self.refresher.ensure_fresh(&tenant_id).await;
                (tenant_id, refreshed)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (tenant_id, refreshed) in results {
            match refreshed {
                Ok(credential) => {
                    state.credentials.insert(tenant_id, credential);
                }
                Err(err) => {
                    report.tenants_skipped += 1;
                    warn!(
                        target: "leasewatch::credentials",
                        tenant = %tenant_id,
                        error.kind = err.kind(),
                        error = %err,
                        "skipping tenant for this cycle"
                    );
                }
            }
        }
    }

    async fn poll_all(&self, state: &mut CycleState, report: &mut CycleReport) {
        let concurrency = self.schedule.poll_concurrency.max(1);
        let ready: Vec<(Tenant, Credential)> = state
            .tenants
            .iter()
            .filter_map(|tenant| {
                state
                    .credentials
                    .get(&tenant.tenant_id)
                    .map(|credential| (tenant.clone(), credential.clone()))
            })
            .collect();
        let results: Vec<(TenantId, Result<PollOutcome>)> = stream::iter(ready)
            .map(|(tenant, credential)| async move {
                let polled = self.poller.poll(&tenant, &credential).await;
                (tenant.tenant_id, polled)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (tenant_id, polled) in results {
            match polled {
                Ok(outcome) => report.record_poll(&outcome),
                Err(err) => {
                    report.tenants_skipped += 1;
                    warn!(
                        target: "leasewatch::poll",
                        tenant = %tenant_id,
                        error.kind = err.kind(),
                        error = %err,
                        "poll failed; cursor left at last checkpoint"
                    );
                    if matches!(err, PollError::Credential { .. }) {
                        state.credentials.remove(&tenant_id);
                    }
                }
            }
        }
    }

    /// Claim a batch per tenant and kind. A tenant whose claim fails is
    /// skipped for this iteration.
    async fn claim_all(&self, state: &CycleState) -> Vec<WatchRecord> {
        let mut claimed = Vec::new();
        for tenant in &state.tenants {
            if !state.credentials.contains_key(&tenant.tenant_id) {
                continue;
            }
            for kind in WatchKind::all_kinds() {
                match self
                    .leases
                    .claim(
                        &state.owner,
                        &tenant.tenant_id,
                        *kind,
                        self.lease.batch_size,
                        self.lease.duration,
                    )
                    .await
                {
                    Ok(batch) => claimed.extend(batch),
                    Err(err) => warn!(
                        target: "leasewatch::lease",
                        tenant = %tenant.tenant_id,
                        kind = %kind,
                        error.kind = err.kind(),
                        error = %err,
                        "claim failed"
                    ),
                }
            }
        }
        claimed
    }
}
