//! Watch records: one stored marker per discovered unit of work.
//!
//! A record moves between two derived lease states. It is *claimed* while it
//! has an owner whose `locked_until` lies in the future and *unclaimed*
//! otherwise; nothing else is stored about the lease. Independently of the
//! lease, a record is *pending* while the newest upstream change it has seen
//! (`source_modified_at`) has not been covered by a successful dispatch.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::ModelError,
    ids::{RecordId, TenantId, WorkerId},
};

/// The two flavours of watch record. They are structurally identical and
/// differ only in who creates them.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WatchKind {
    /// Created by the change poller from the upstream change feed.
    Encounter,
    /// Created by fan-out classification of an encounter.
    Document,
}

impl WatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchKind::Encounter => "encounter",
            WatchKind::Document => "document",
        }
    }

    pub fn all_kinds() -> &'static [Self] {
        &[WatchKind::Encounter, WatchKind::Document]
    }
}

impl fmt::Display for WatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchKind {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "encounter" => Ok(WatchKind::Encounter),
            "document" => Ok(WatchKind::Document),
            other => Err(ModelError::UnknownWatchKind(other.to_string())),
        }
    }
}

/// Storage identity of a watch record.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchKey {
    pub tenant_id: TenantId,
    pub kind: WatchKind,
    pub record_id: RecordId,
}

impl WatchKey {
    pub fn new(tenant_id: TenantId, kind: WatchKind, record_id: RecordId) -> Self {
        Self {
            tenant_id,
            kind,
            record_id,
        }
    }
}

/// Renders as `tenant:kind:record`, which doubles as the downstream
/// deduplication id.
impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.tenant_id, self.kind, self.record_id)
    }
}

/// An item surfaced by the change poller or by classification, before it is
/// merged into the lease store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredWatch {
    pub tenant_id: TenantId,
    pub kind: WatchKind,
    pub record_id: RecordId,
    pub modified_at: DateTime<Utc>,
    pub document_type: Option<String>,
    pub parent_id: Option<RecordId>,
}

impl DiscoveredWatch {
    pub fn key(&self) -> WatchKey {
        WatchKey::new(self.tenant_id.clone(), self.kind, self.record_id.clone())
    }
}

/// Derived lease state at a given instant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseState {
    Unclaimed,
    Claimed {
        owner: WorkerId,
        until: DateTime<Utc>,
    },
}

impl LeaseState {
    pub fn is_claimed(&self) -> bool {
        matches!(self, LeaseState::Claimed { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRecord {
    pub tenant_id: TenantId,
    pub kind: WatchKind,
    pub record_id: RecordId,
    pub discovered_at: DateTime<Utc>,
    /// After this instant the record is garbage: never claimed again.
    pub ttl_deadline: DateTime<Utc>,
    pub lease_owner: Option<WorkerId>,
    pub locked_until: Option<DateTime<Utc>>,
    pub source_modified_at: DateTime<Utc>,
    pub dispatched_through: Option<DateTime<Utc>>,
    pub document_type: Option<String>,
    pub parent_id: Option<RecordId>,
    /// Successful claims so far. Diagnostic only.
    pub claim_count: u32,
    /// Bumped on every write; part of the compare-and-swap token.
    pub version: u64,
}

impl WatchRecord {
    /// Fresh, unclaimed record for a newly discovered item.
    pub fn discovered(
        item: DiscoveredWatch,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            tenant_id: item.tenant_id,
            kind: item.kind,
            record_id: item.record_id,
            discovered_at: now,
            ttl_deadline: now
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            lease_owner: None,
            locked_until: None,
            source_modified_at: item.modified_at,
            dispatched_through: None,
            document_type: item.document_type,
            parent_id: item.parent_id,
            claim_count: 0,
            version: 0,
        }
    }

    pub fn key(&self) -> WatchKey {
        WatchKey::new(self.tenant_id.clone(), self.kind, self.record_id.clone())
    }

    pub fn lease_state(&self, now: DateTime<Utc>) -> LeaseState {
        match (&self.lease_owner, self.locked_until) {
            (Some(owner), Some(until)) if until > now => LeaseState::Claimed {
                owner: owner.clone(),
                until,
            },
            _ => LeaseState::Unclaimed,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_deadline <= now
    }

    pub fn is_pending(&self) -> bool {
        self.dispatched_through
            .is_none_or(|through| through < self.source_modified_at)
    }

    /// TTL live, work outstanding and no live lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now)
            && self.is_pending()
            && !self.lease_state(now).is_claimed()
    }

    pub fn is_owned_by(&self, owner: &WorkerId) -> bool {
        self.lease_owner.as_ref() == Some(owner)
    }
}
