use std::time::Duration;

use leasewatch_model::WorkerId;
use serde::Serialize;
use tracing::info;

use crate::{dispatch::DispatchSummary, lease::SweepSummary, poller::PollOutcome};

/// Summary of one invocation, logged when it ends and returned to manual
/// triggers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub invocation: String,
    /// Tenants whose change scan completed.
    pub tenants_polled: usize,
    /// Tenants whose scan stopped early (rate limit or page cap).
    pub tenants_partial: usize,
    /// Tenants skipped for a credential or upstream failure.
    pub tenants_skipped: usize,
    /// Watch upserts produced by change polling.
    pub discovered: usize,
    pub created: usize,
    pub claim_iterations: u32,
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
    pub deferred: usize,
    pub lease_lost: usize,
    pub swept: usize,
    pub poison: usize,
    /// The invocation deadline cut the cycle short.
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl CycleReport {
    pub fn new(invocation: &WorkerId) -> Self {
        Self {
            invocation: invocation.to_string(),
            ..Self::default()
        }
    }

    pub fn record_poll(&mut self, outcome: &PollOutcome) {
        if outcome.is_complete() {
            self.tenants_polled += 1;
        } else {
            self.tenants_partial += 1;
        }
        self.discovered += outcome.upserts.total();
        self.created += outcome.upserts.created;
    }

    pub fn record_dispatch(&mut self, summary: DispatchSummary) {
        self.dispatched += summary.dispatched;
        self.failed += summary.failed;
        self.deferred += summary.deferred;
        self.lease_lost += summary.lease_lost;
    }

    pub fn record_sweep(&mut self, summary: SweepSummary) {
        self.swept += summary.deleted;
        self.poison += summary.poison;
    }

    pub fn finish(&mut self, elapsed: Duration) {
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }

    pub fn log(&self) {
        info!(
            target: "leasewatch::cycle",
            invocation = %self.invocation,
            tenants_polled = self.tenants_polled,
            tenants_partial = self.tenants_partial,
            tenants_skipped = self.tenants_skipped,
            discovered = self.discovered,
            created = self.created,
            claim_iterations = self.claim_iterations,
            claimed = self.claimed,
            dispatched = self.dispatched,
            failed = self.failed,
            deferred = self.deferred,
            lease_lost = self.lease_lost,
            swept = self.swept,
            poison = self.poison,
            timed_out = self.timed_out,
            elapsed_ms = self.elapsed_ms,
            "cycle complete"
        );
    }
}
