//! Core data model definitions shared across leasewatch crates.
//!
//! Everything here is plain data: identifiers, the tenant registry entry,
//! per-tenant credentials, watch records and their derived lease state, and
//! the message handed to the downstream queue. Behaviour that touches the
//! lease store or the upstream API lives in `leasewatch-core`.
#![allow(missing_docs)]

pub mod credential;
pub mod dispatch;
pub mod error;
pub mod ids;
pub mod tenant;
pub mod watch;

pub use credential::{Credential, SecretToken};
pub use dispatch::DispatchMessage;
pub use error::{ModelError, Result as ModelResult};
pub use ids::{RecordId, TenantId, WorkerId};
pub use tenant::Tenant;
pub use watch::{
    DiscoveredWatch, LeaseState, WatchKey, WatchKind, WatchRecord,
};
