use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leasewatch_config::RateLimitPolicy;
use leasewatch_model::{
    Credential, DiscoveredWatch, Tenant, TenantId, WatchKey, WatchKind,
    WatchRecord, WorkerId,
};

use super::{
    LeaseStore, PermitDecision, UpsertOutcome, UpsertPlan, decide_permit,
    plan_upsert,
};
use crate::error::Result;

/// Process-local lease store. Each operation runs under one mutex, which
/// makes every conditional write atomic within the process. Used by tests
/// and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryLeaseStore {
    state: Arc<tokio::sync::Mutex<StoreState>>,
}

#[derive(Default)]
struct StoreState {
    tenants: BTreeMap<TenantId, Tenant>,
    credentials: HashMap<TenantId, Credential>,
    watches: BTreeMap<WatchKey, WatchRecord>,
    rate_windows: HashMap<TenantId, (DateTime<Utc>, u32)>,
}

impl fmt::Debug for InMemoryLeaseStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryLeaseStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("tenants", &state.tenants.len())
                    .field("credentials", &state.credentials.len())
                    .field("watches", &state.watches.len())
                    .field("rate_windows", &state.rate_windows.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a tenant with an explicit cursor. Test and bootstrap helper.
    pub async fn insert_tenant(&self, tenant: Tenant) {
        let mut state = self.state.lock().await;
        state.tenants.insert(tenant.tenant_id.clone(), tenant);
    }

    /// Write a record verbatim, bypassing the upsert rules.
    pub async fn insert_watch(&self, record: WatchRecord) {
        let mut state = self.state.lock().await;
        state.watches.insert(record.key(), record);
    }

    pub async fn watch_count(&self) -> usize {
        self.state.lock().await.watches.len()
    }

    pub async fn all_watches(&self) -> Vec<WatchRecord> {
        self.state.lock().await.watches.values().cloned().collect()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn active_tenants(&self) -> Result<Vec<Tenant>> {
        let state = self.state.lock().await;
        Ok(state
            .tenants
            .values()
            .filter(|tenant| tenant.active)
            .cloned()
            .collect())
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.values().cloned().collect())
    }

    async fn get_tenant(&self, tenant_id: &TenantId) -> Result<Option<Tenant>> {
        let state = self.state.lock().await;
        Ok(state.tenants.get(tenant_id).cloned())
    }

    async fn upsert_tenant(
        &self,
        tenant_id: &TenantId,
        active: bool,
    ) -> Result<Tenant> {
        let mut state = self.state.lock().await;
        let tenant = state
            .tenants
            .entry(tenant_id.clone())
            .or_insert_with(|| Tenant::new(tenant_id.clone()));
        tenant.active = active;
        Ok(tenant.clone())
    }

    async fn advance_cursor(
        &self,
        tenant_id: &TenantId,
        cursor: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(tenant) = state.tenants.get_mut(tenant_id) else {
            return Ok(false);
        };
        if tenant.cursor.is_some_and(|stored| stored >= cursor) {
            return Ok(false);
        }
        tenant.cursor = Some(cursor);
        Ok(true)
    }

    async fn get_credential(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<Credential>> {
        let state = self.state.lock().await;
        Ok(state.credentials.get(tenant_id).cloned())
    }

    async fn put_credential(&self, credential: &Credential) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .credentials
            .insert(credential.tenant_id.clone(), credential.clone());
        Ok(())
    }

    async fn upsert_watch(
        &self,
        item: &DiscoveredWatch,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<UpsertOutcome> {
        let mut state = self.state.lock().await;
        let key = item.key();
        let (outcome, plan) = plan_upsert(state.watches.get(&key), item, now, ttl);
        match plan {
            UpsertPlan::Insert(record) | UpsertPlan::Update(record) => {
                state.watches.insert(key, record);
            }
            UpsertPlan::Untouched => {}
        }
        Ok(outcome)
    }

    async fn get_watch(&self, key: &WatchKey) -> Result<Option<WatchRecord>> {
        let state = self.state.lock().await;
        Ok(state.watches.get(key).cloned())
    }

    async fn claim_candidates(
        &self,
        tenant_id: &TenantId,
        kind: WatchKind,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WatchRecord>> {
        let state = self.state.lock().await;
        let mut candidates: Vec<WatchRecord> = state
            .watches
            .values()
            .filter(|record| {
                &record.tenant_id == tenant_id
                    && record.kind == kind
                    && record.is_claimable(now)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.discovered_at
                .cmp(&b.discovered_at)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn compare_and_claim(
        &self,
        expected: &WatchRecord,
        owner: &WorkerId,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
    ) -> Result<Option<WatchRecord>> {
        let mut state = self.state.lock().await;
        let Some(stored) = state.watches.get_mut(&expected.key()) else {
            return Ok(None);
        };

        if stored.version != expected.version
            || stored.locked_until != expected.locked_until
            || !stored.is_claimable(now)
        {
            return Ok(None);
        }

        stored.lease_owner = Some(owner.clone());
        stored.locked_until = Some(locked_until);
        stored.claim_count += 1;
        stored.version += 1;
        Ok(Some(stored.clone()))
    }

    async fn release(&self, key: &WatchKey, owner: &WorkerId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.watches.get_mut(key) {
            Some(stored) if stored.is_owned_by(owner) => {
                stored.lease_owner = None;
                stored.locked_until = None;
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        key: &WatchKey,
        owner: &WorkerId,
        through: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.watches.get_mut(key) {
            Some(stored) if stored.is_owned_by(owner) => {
                stored.lease_owner = None;
                stored.locked_until = None;
                stored.dispatched_through = Some(
                    stored
                        .dispatched_through
                        .map_or(through, |previous| previous.max(through)),
                );
                stored.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WatchRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .watches
            .values()
            .filter(|record| record.is_expired(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_expired(
        &self,
        key: &WatchKey,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state
            .watches
            .get(key)
            .is_some_and(|record| record.is_expired(now))
        {
            state.watches.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn try_consume_permit(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        policy: RateLimitPolicy,
    ) -> Result<PermitDecision> {
        let mut state = self.state.lock().await;
        let current = state.rate_windows.get(tenant_id).copied();
        let (decision, next) = decide_permit(current, now, policy);
        if let Some(window) = next {
            state.rate_windows.insert(tenant_id.clone(), window);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use leasewatch_model::RecordId;

    fn tenant() -> TenantId {
        TenantId::new("firm-a").unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()
    }

    fn discovered(id: &str) -> DiscoveredWatch {
        DiscoveredWatch {
            tenant_id: tenant(),
            kind: WatchKind::Encounter,
            record_id: RecordId::new(id).unwrap(),
            modified_at: t0() - chrono::Duration::minutes(1),
            document_type: None,
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn cursor_only_moves_forward() {
        let store = InMemoryLeaseStore::new();
        store.upsert_tenant(&tenant(), true).await.unwrap();

        assert!(store.advance_cursor(&tenant(), t0()).await.unwrap());
        assert!(
            !store
                .advance_cursor(&tenant(), t0() - chrono::Duration::seconds(1))
                .await
                .unwrap()
        );
        assert!(!store.advance_cursor(&tenant(), t0()).await.unwrap());

        let stored = store.get_tenant(&tenant()).await.unwrap().unwrap();
        assert_eq!(stored.cursor, Some(t0()));
    }

    #[tokio::test]
    async fn toggling_a_tenant_keeps_its_cursor() {
        let store = InMemoryLeaseStore::new();
        store.insert_tenant(Tenant::new(tenant()).with_cursor(t0())).await;

        let updated = store.upsert_tenant(&tenant(), false).await.unwrap();
        assert!(!updated.active);
        assert_eq!(updated.cursor, Some(t0()));
        assert!(store.active_tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_claim_token_loses() {
        let store = InMemoryLeaseStore::new();
        let ttl = chrono::Duration::hours(24);
        store.upsert_watch(&discovered("enc-1"), t0(), ttl).await.unwrap();

        let snapshot = store
            .claim_candidates(&tenant(), WatchKind::Encounter, t0(), 10)
            .await
            .unwrap()
            .remove(0);

        let a = WorkerId::from_raw("inv-a");
        let b = WorkerId::from_raw("inv-b");
        let until = t0() + chrono::Duration::seconds(30);

        let won = store
            .compare_and_claim(&snapshot, &a, t0(), until)
            .await
            .unwrap();
        assert!(won.is_some());
        let lost = store
            .compare_and_claim(&snapshot, &b, t0(), until)
            .await
            .unwrap();
        assert!(lost.is_none());

        assert!(!store.release(&snapshot.key(), &b).await.unwrap());
        assert!(store.release(&snapshot.key(), &a).await.unwrap());
    }

    #[tokio::test]
    async fn completion_requires_ownership_and_clears_pending() {
        let store = InMemoryLeaseStore::new();
        let ttl = chrono::Duration::hours(24);
        store.upsert_watch(&discovered("enc-2"), t0(), ttl).await.unwrap();
        let snapshot = store
            .claim_candidates(&tenant(), WatchKind::Encounter, t0(), 1)
            .await
            .unwrap()
            .remove(0);
        let owner = WorkerId::from_raw("inv-a");
        let claimed = store
            .compare_and_claim(
                &snapshot,
                &owner,
                t0(),
                t0() + chrono::Duration::seconds(30),
            )
            .await
            .unwrap()
            .unwrap();

        let intruder = WorkerId::from_raw("inv-z");
        assert!(
            !store
                .complete(&claimed.key(), &intruder, claimed.source_modified_at)
                .await
                .unwrap()
        );
        assert!(
            store
                .complete(&claimed.key(), &owner, claimed.source_modified_at)
                .await
                .unwrap()
        );

        let stored = store.get_watch(&claimed.key()).await.unwrap().unwrap();
        assert!(!stored.is_pending());
        assert!(stored.lease_owner.is_none());
        assert_eq!(stored.claim_count, 1);
        assert!(
            store
                .claim_candidates(&tenant(), WatchKind::Encounter, t0(), 10)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn delete_expired_skips_records_that_were_replaced() {
        let store = InMemoryLeaseStore::new();
        let ttl = chrono::Duration::hours(1);
        store.upsert_watch(&discovered("enc-3"), t0(), ttl).await.unwrap();
        let key = discovered("enc-3").key();

        let later = t0() + chrono::Duration::hours(2);
        assert_eq!(store.list_expired(later, 10).await.unwrap().len(), 1);
        assert!(!store.delete_expired(&key, t0()).await.unwrap());
        assert!(store.delete_expired(&key, later).await.unwrap());
        assert_eq!(store.watch_count().await, 0);
    }
}
