use std::{sync::Arc, time::Duration};

use tokio::{task::JoinSet, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{CycleReport, Orchestrator};
use crate::error::Result;

/// Fires one invocation per interval tick without waiting for the previous
/// one. In-flight invocations are awaited on shutdown; each is bounded by its
/// own deadline.
#[derive(Debug, Clone)]
pub struct ScheduleRunner {
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
}

impl ScheduleRunner {
    pub fn new(orchestrator: Arc<Orchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: JoinSet<Result<CycleReport>> = JoinSet::new();

        info!(
            target: "leasewatch::cycle",
            interval = ?self.interval,
            "schedule started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(target: "leasewatch::cycle", "schedule shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let orchestrator = self.orchestrator.clone();
                    in_flight.spawn(async move { orchestrator.run_invocation().await });
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_joined(joined);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            log_joined(joined);
        }
    }
}

fn log_joined(joined: std::result::Result<Result<CycleReport>, tokio::task::JoinError>) {
    // Successful and failed cycles already logged themselves.
    if let Err(err) = joined {
        warn!(target: "leasewatch::cycle", error = %err, "invocation task panicked");
    }
}
