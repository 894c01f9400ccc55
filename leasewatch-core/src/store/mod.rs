//! Shared lease store: every piece of mutable orchestration state lives here.
//!
//! All mutation goes through conditional writes keyed by record identity.
//! Nothing in this crate relies on an in-process lock for exclusivity, so the
//! memory and Postgres backends give the same guarantees (the memory backend
//! only within one process).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasewatch_config::RateLimitPolicy;
use leasewatch_model::{
    Credential, DiscoveredWatch, Tenant, TenantId, WatchKey, WatchKind,
    WatchRecord, WorkerId,
};

use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryLeaseStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresLeaseStore;

/// What an upsert did to the stored watch record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New record, or a fully dispatched expired record replaced by a fresh one.
    Created,
    /// Live unclaimed record; TTL and discovery time refreshed.
    Refreshed,
    /// Live claimed record; only the source timestamp advanced.
    Busy,
    /// Expired while still pending. Left untouched, never resurrected.
    Abandoned,
}

/// Result of one attempt to take a rate-limit permit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermitDecision {
    Granted,
    /// The current window is used up; it reopens after `retry_after`.
    Denied { retry_after: Duration },
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<Tenant>>;

    async fn list_tenants(&self) -> Result<Vec<Tenant>>;

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>>;

    /// Register a tenant or toggle its `active` flag. Never touches the cursor.
    async fn upsert_tenant(
        &self,
        tenant_id: &TenantId,
        active: bool,
    ) -> Result<Tenant>;

    /// Conditional cursor write: applied only when the stored cursor is unset
    /// or strictly older than `cursor`. Returns whether the write happened.
    async fn advance_cursor(
        &self,
        tenant_id: &TenantId,
        cursor: DateTime<Utc>,
    ) -> Result<bool>;

    async fn get_credential(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Credential>>;

    async fn put_credential(&self, credential: &Credential) -> Result<()>;

    /// Merge a discovered item into the stored record (see [`plan_upsert`]).
    async fn upsert_watch(
        &self,
        item: &DiscoveredWatch,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UpsertOutcome>;

    async fn get_watch(&self, key: &WatchKey) -> Result<Option<WatchRecord>>;

    /// Up to `limit` records that are claimable at `now`, oldest discovery
    /// first. A snapshot only: the claim itself must still win its CAS.
    async fn claim_candidates(
        &self,
        tenant_id: &TenantId,
        kind: WatchKind,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WatchRecord>>;

    /// Take the lease on `expected` if its stored `locked_until` and
    /// `version` still match, the lease is free and the TTL is live.
    /// Returns the updated record, or `None` when another writer got there
    /// first.
    async fn compare_and_claim(
        &self,
        expected: &WatchRecord,
        owner: &WorkerId,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<WatchRecord>>;

    /// Clear the lease if `owner` still holds it.
    async fn release(&self, key: &WatchKey, owner: &WorkerId) -> Result<bool>;

    /// Clear the lease and mark the record dispatched through `through`, if
    /// `owner` still holds it.
    async fn complete(
        &self,
        key: &WatchKey,
        owner: &WorkerId,
        through: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WatchRecord>>;

    /// Delete the record only if it is still expired at `now`.
    async fn delete_expired(
        &self,
        key: &WatchKey,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Atomically consume one permit from the tenant's fixed window.
    async fn try_consume_permit(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        policy: RateLimitPolicy,
    ) -> Result<PermitDecision>;
}

/// Write a backend should perform for an upsert.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpsertPlan {
    Insert(WatchRecord),
    Update(WatchRecord),
    Untouched,
}

/// Decide how a discovered item merges into the stored record.
///
/// * absent: fresh unclaimed record, TTL from `now`
/// * live and unclaimed: discovery time and TTL refreshed, source timestamp
///   advanced, lease fields untouched
/// * live and claimed: only the source timestamp advances
/// * expired and still pending: untouched
/// * expired and fully dispatched: replaced by a fresh record
pub fn plan_upsert(
    existing: Option<&WatchRecord>,
    item: &DiscoveredWatch,
    now: DateTime<Utc>,
    ttl: chrono::Duration,
) -> (UpsertOutcome, UpsertPlan) {
    let Some(current) = existing else {
        return (
            UpsertOutcome::Created,
            UpsertPlan::Insert(WatchRecord::discovered(item.clone(), now, ttl)),
        );
    };

    if current.is_expired(now) {
        if current.is_pending() {
            return (UpsertOutcome::Abandoned, UpsertPlan::Untouched);
        }
        let mut fresh = WatchRecord::discovered(item.clone(), now, ttl);
        fresh.version = current.version + 1;
        return (UpsertOutcome::Created, UpsertPlan::Update(fresh));
    }

    let mut next = current.clone();
    next.source_modified_at = next.source_modified_at.max(item.modified_at);
    next.version += 1;

    if current.lease_state(now).is_claimed() {
        return (UpsertOutcome::Busy, UpsertPlan::Update(next));
    }

    next.discovered_at = now;
    next.ttl_deadline = now
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    if item.document_type.is_some() {
        next.document_type = item.document_type.clone();
    }
    if item.parent_id.is_some() {
        next.parent_id = item.parent_id.clone();
    }
    (UpsertOutcome::Refreshed, UpsertPlan::Update(next))
}

/// Fixed-window arithmetic shared by both backends. `window` is the stored
/// `(window_started_at, used)` pair, if any.
pub(crate) fn decide_permit(
    window: Option<(DateTime<Utc>, u32)>,
    now: DateTime<Utc>,
    policy: RateLimitPolicy,
) -> (PermitDecision, Option<(DateTime<Utc>, u32)>) {
    let length = chrono::Duration::from_std(policy.window)
        .unwrap_or(chrono::Duration::MAX);

    let reopens_at = |started: DateTime<Utc>| {
        started
            .checked_add_signed(length)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    };

    match window {
        Some((started, used)) if now < reopens_at(started) => {
            if used < policy.calls_per_window {
                (PermitDecision::Granted, Some((started, used + 1)))
            } else {
                let retry_after = (reopens_at(started) - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                (PermitDecision::Denied { retry_after }, None)
            }
        }
        _ => (PermitDecision::Granted, Some((now, 1))),
    }
}
