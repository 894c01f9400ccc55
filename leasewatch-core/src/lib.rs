//! Lease-based polling orchestration.
//!
//! One invocation discovers active tenants, refreshes their credentials,
//! polls the upstream API for changes since each tenant's cursor, and then
//! claims and dispatches pending watch records under short leases. All
//! coordination between overlapping invocations goes through a
//! [`store::LeaseStore`] and its conditional writes.
#![allow(missing_docs)]

pub mod credentials;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod lease;
pub mod orchestrator;
pub mod poller;
pub mod rate_limit;
pub mod store;
pub mod time;
pub mod upstream;

pub use error::{PollError, Result};

/// Embedded schema migrations for the Postgres lease store.
#[cfg(feature = "postgres")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
