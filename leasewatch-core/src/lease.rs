//! Claiming, releasing and completing watch records under time-bounded
//! leases, plus TTL sweeping.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use leasewatch_model::{TenantId, WatchKey, WatchKind, WatchRecord, WorkerId};
use tracing::{debug, info, warn};

use crate::{
    error::{PollError, Result},
    store::LeaseStore,
    time::{TimeProvider, to_chrono},
};

/// Expired records examined per sweep.
const SWEEP_BATCH: usize = 500;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub deleted: usize,
    /// Pending records that were claimed at least once and never completed.
    pub poison: usize,
    /// Pending records nobody ever claimed.
    pub abandoned: usize,
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    time: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager").finish_non_exhaustive()
    }
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, time: Arc<dyn TimeProvider>) -> Self {
        Self { store, time }
    }

    /// Claim up to `batch_size` claimable records for `owner`. Records lost
    /// to another writer are dropped from the result.
    pub async fn claim(
        &self,
        owner: &WorkerId,
        tenant_id: &TenantId,
        kind: WatchKind,
        batch_size: usize,
        lease_duration: Duration,
    ) -> Result<Vec<WatchRecord>> {
        let now = self.time.utc_now();
        let locked_until = now
            .checked_add_signed(to_chrono(lease_duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let candidates = self
            .store
            .claim_candidates(tenant_id, kind, now, batch_size)
            .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        let mut contended = 0usize;
        for candidate in &candidates {
            match self
                .store
                .compare_and_claim(candidate, owner, now, locked_until)
                .await?
            {
                Some(record) => claimed.push(record),
                None => contended += 1,
            }
        }

        if contended > 0 {
            debug!(
                target: "leasewatch::lease",
                tenant = %tenant_id,
                kind = %kind,
                owner = %owner,
                contended,
                "lost claims to another invocation"
            );
        }
        debug!(
            target: "leasewatch::lease",
            tenant = %tenant_id,
            kind = %kind,
            owner = %owner,
            claimed = claimed.len(),
            "claim batch"
        );
        Ok(claimed)
    }

    pub async fn release(&self, key: &WatchKey, owner: &WorkerId) -> Result<bool> {
        self.store.release(key, owner).await
    }

    pub async fn complete(
        &self,
        key: &WatchKey,
        owner: &WorkerId,
        through: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.complete(key, owner, through).await
    }

    /// Delete every record whose TTL has passed at `now`, logging the ones
    /// that were still pending.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        loop {
            let expired = self.store.list_expired(now, SWEEP_BATCH).await?;
            if expired.is_empty() {
                break;
            }
            let batch_len = expired.len();
            let mut progressed = false;

            for record in expired {
                let key = record.key();
                if !self.store.delete_expired(&key, now).await? {
                    continue;
                }
                progressed = true;
                summary.deleted += 1;

                if !record.is_pending() {
                    continue;
                }
                if record.claim_count > 0 {
                    summary.poison += 1;
                    let err = PollError::PoisonRecord(key.to_string());
                    warn!(
                        target: "leasewatch::lease",
                        tenant = %record.tenant_id,
                        record = %record.record_id,
                        kind = %record.kind,
                        claim_count = record.claim_count,
                        error.kind = err.kind(),
                        "{err}"
                    );
                } else {
                    summary.abandoned += 1;
                    info!(
                        target: "leasewatch::lease",
                        tenant = %record.tenant_id,
                        record = %record.record_id,
                        kind = %record.kind,
                        "watch expired before it was ever claimed"
                    );
                }
            }

            if !progressed || batch_len < SWEEP_BATCH {
                break;
            }
        }

        if summary.deleted > 0 {
            info!(
                target: "leasewatch::lease",
                deleted = summary.deleted,
                poison = summary.poison,
                abandoned = summary.abandoned,
                "swept expired watch records"
            );
        }
        Ok(summary)
    }
}
