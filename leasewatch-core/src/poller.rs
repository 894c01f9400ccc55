//! Incremental change polling for one tenant.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use leasewatch_config::PollerConfig;
use leasewatch_model::{Credential, DiscoveredWatch, Tenant, TenantId, WatchKind};
use tracing::{debug, info, instrument};

use crate::{
    error::Result,
    rate_limit::{PermitOutcome, RateLimiter},
    store::{LeaseStore, UpsertOutcome},
    time::{TimeProvider, to_chrono},
    upstream::UpstreamClient,
};

/// Per-outcome upsert counts for one poll.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub created: usize,
    pub refreshed: usize,
    pub busy: usize,
    pub abandoned: usize,
}

impl UpsertCounts {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Created => self.created += 1,
            UpsertOutcome::Refreshed => self.refreshed += 1,
            UpsertOutcome::Busy => self.busy += 1,
            UpsertOutcome::Abandoned => self.abandoned += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.created + self.refreshed + self.busy + self.abandoned
    }
}

/// Why a poll stopped before exhausting the listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialReason {
    RateLimited { retry_after: Duration },
    PageCap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Full scan. `cursor` is the newest timestamp observed, if any item was.
    Complete { cursor: Option<DateTime<Utc>> },
    /// Stopped early. The cursor sits just below the last fully upserted
    /// page, or where it was if no page completed.
    Partial(PartialReason),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollOutcome {
    pub tenant_id: TenantId,
    pub status: PollStatus,
    pub pages: u32,
    pub upserts: UpsertCounts,
    pub cursor_advanced: bool,
}

impl PollOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, PollStatus::Complete { .. })
    }
}

#[derive(Clone)]
pub struct ChangePoller {
    store: Arc<dyn LeaseStore>,
    upstream: Arc<dyn UpstreamClient>,
    limiter: RateLimiter,
    time: Arc<dyn TimeProvider>,
    config: PollerConfig,
    watch_ttl: Duration,
}

impl std::fmt::Debug for ChangePoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangePoller")
            .field("config", &self.config)
            .field("watch_ttl", &self.watch_ttl)
            .finish_non_exhaustive()
    }
}

impl ChangePoller {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        upstream: Arc<dyn UpstreamClient>,
        limiter: RateLimiter,
        time: Arc<dyn TimeProvider>,
        config: PollerConfig,
        watch_ttl: Duration,
    ) -> Self {
        Self {
            store,
            upstream,
            limiter,
            time,
            config,
            watch_ttl,
        }
    }

    /// Scan everything modified strictly after the tenant's cursor and upsert
    /// an encounter watch per item.
    ///
    /// The listing is expected in ascending `modified_at` order. Once a page
    /// is fully upserted the cursor is checkpointed just below that page's
    /// last timestamp, so a backlog larger than one poll's budget still
    /// drains across cycles and items tied at the boundary are re-read
    /// rather than skipped. A full scan finishes by advancing the cursor to
    /// the newest timestamp seen. Errors propagate with the cursor at its
    /// last checkpoint.
    #[instrument(
        name = "poll.tenant",
        skip_all,
        fields(tenant = %tenant.tenant_id, cursor = ?tenant.cursor)
    )]
    pub async fn poll(&self, tenant: &Tenant, credential: &Credential) -> Result<PollOutcome> {
        let ttl = to_chrono(self.watch_ttl);
        let mut upserts = UpsertCounts::default();
        let mut newest: Option<DateTime<Utc>> = None;
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        let mut cursor_advanced = false;

        let partial = |reason, pages, upserts, cursor_advanced| PollOutcome {
            tenant_id: tenant.tenant_id.clone(),
            status: PollStatus::Partial(reason),
            pages,
            upserts,
            cursor_advanced,
        };

        loop {
            if let PermitOutcome::Deferred { retry_after } =
                self.limiter.acquire(&tenant.tenant_id).await?
            {
                info!(
                    target: "leasewatch::poll",
                    tenant = %tenant.tenant_id,
                    pages,
                    cursor_advanced,
                    "rate limited; resuming from checkpoint next cycle"
                );
                return Ok(partial(
                    PartialReason::RateLimited { retry_after },
                    pages,
                    upserts,
                    cursor_advanced,
                ));
            }

            let page = self
                .upstream
                .list_changes(
                    credential,
                    tenant.cursor,
                    self.config.page_size,
                    page_token.as_deref(),
                )
                .await?;
            pages += 1;
            let page_last = page.items.last().map(|item| item.modified_at);

            for item in page.items {
                if tenant.cursor.is_some_and(|cursor| item.modified_at <= cursor) {
                    continue;
                }
                newest = newest.max(Some(item.modified_at));

                let watch = DiscoveredWatch {
                    tenant_id: tenant.tenant_id.clone(),
                    kind: WatchKind::Encounter,
                    record_id: item.id,
                    modified_at: item.modified_at,
                    document_type: None,
                    parent_id: None,
                };
                let outcome = self
                    .store
                    .upsert_watch(&watch, self.time.utc_now(), ttl)
                    .await?;
                upserts.record(outcome);
            }

            let Some(token) = page.next_page_token else {
                break;
            };
            if let Some(checkpoint) = page_last.and_then(checkpoint_below) {
                cursor_advanced |= self
                    .store
                    .advance_cursor(&tenant.tenant_id, checkpoint)
                    .await?;
            }
            if pages >= self.config.max_pages {
                info!(
                    target: "leasewatch::poll",
                    tenant = %tenant.tenant_id,
                    pages,
                    cursor_advanced,
                    "page cap reached; resuming from checkpoint next cycle"
                );
                return Ok(partial(PartialReason::PageCap, pages, upserts, cursor_advanced));
            }
            page_token = Some(token);
        }

        if let Some(cursor) = newest {
            cursor_advanced |= self.store.advance_cursor(&tenant.tenant_id, cursor).await?;
        }

        debug!(
            target: "leasewatch::poll",
            tenant = %tenant.tenant_id,
            pages,
            created = upserts.created,
            refreshed = upserts.refreshed,
            busy = upserts.busy,
            abandoned = upserts.abandoned,
            cursor_advanced,
            "poll complete"
        );

        Ok(PollOutcome {
            tenant_id: tenant.tenant_id.clone(),
            status: PollStatus::Complete { cursor: newest },
            pages,
            upserts,
            cursor_advanced,
        })
    }
}

/// Greatest stored timestamp strictly below `at`. Cursors are persisted at
/// microsecond resolution.
fn checkpoint_below(at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    at.checked_sub_signed(chrono::Duration::microseconds(1))
}
