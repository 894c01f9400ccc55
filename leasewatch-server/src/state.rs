use std::{fmt, sync::Arc};

use leasewatch_core::{orchestrator::Orchestrator, store::LeaseStore};

/// Shared state behind the admin router.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        self.orchestrator.store()
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}
