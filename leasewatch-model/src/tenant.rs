use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::TenantId;

/// Registry entry for one tenant.
///
/// `cursor` is the newest upstream modification timestamp already observed.
/// It is `None` until the first complete poll and never moves backwards once
/// set; the lease store enforces that with a conditional write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub active: bool,
    pub cursor: Option<DateTime<Utc>>,
}

impl Tenant {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            active: true,
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: DateTime<Utc>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}
