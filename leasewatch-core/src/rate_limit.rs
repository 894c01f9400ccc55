//! Per-tenant fixed-window rate limiter backed by the lease store.
//!
//! The window lives in the store, so every invocation and every process draws
//! from one quota per tenant.

use std::{sync::Arc, time::Duration};

use leasewatch_config::RateLimitConfig;
use leasewatch_model::TenantId;
use tracing::debug;

use crate::{
    error::Result,
    store::{LeaseStore, PermitDecision},
    time::TimeProvider,
};

const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Whether a caller may make its upstream call now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermitOutcome {
    Granted,
    /// No permit within the acquire timeout. The caller skips the call for
    /// this cycle.
    Deferred { retry_after: Duration },
}

impl PermitOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, PermitOutcome::Granted)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn LeaseStore>,
    time: Arc<dyn TimeProvider>,
    config: RateLimitConfig,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        time: Arc<dyn TimeProvider>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            time,
            config,
        }
    }

    /// Take one permit for `tenant_id`, waiting up to the configured acquire
    /// timeout. A window that reopens later than the remaining wait defers
    /// immediately instead of sleeping.
    pub async fn acquire(&self, tenant_id: &TenantId) -> Result<PermitOutcome> {
        let policy = self.config.policy_for(tenant_id.as_str());
        let mut remaining = self.config.acquire_timeout;

        loop {
            let now = self.time.utc_now();
            let retry_after =
                match self.store.try_consume_permit(tenant_id, now, policy).await? {
                    PermitDecision::Granted => return Ok(PermitOutcome::Granted),
                    PermitDecision::Denied { retry_after } => retry_after,
                };

            if retry_after > remaining {
                debug!(
                    target: "leasewatch::poll",
                    tenant = %tenant_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "rate limit window exhausted; deferring"
                );
                return Ok(PermitOutcome::Deferred { retry_after });
            }

            let wait = retry_after.max(MIN_BACKOFF);
            self.time.sleep(wait).await;
            remaining = remaining.saturating_sub(wait);
        }
    }
}
