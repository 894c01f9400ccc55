use std::sync::Arc;

use leasewatch_model::Tenant;
use tracing::debug;

use crate::{error::Result, store::LeaseStore};

/// Lists the tenants eligible for polling. Read-only.
#[derive(Clone)]
pub struct TenantDiscovery {
    store: Arc<dyn LeaseStore>,
}

impl std::fmt::Debug for TenantDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDiscovery").finish_non_exhaustive()
    }
}

impl TenantDiscovery {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Active tenants. A store failure here aborts the invocation.
    pub async fn active_tenants(&self) -> Result<Vec<Tenant>> {
        let tenants = self.store.active_tenants().await?;
        debug!(
            target: "leasewatch::cycle",
            tenants = tenants.len(),
            "discovered active tenants"
        );
        Ok(tenants)
    }
}
