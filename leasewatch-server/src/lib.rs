//! # Leasewatch Server
//!
//! Runs the polling orchestrator on a fixed interval and exposes a small
//! admin HTTP surface for health checks, the tenant registry and manual
//! re-polls.

pub mod bootstrap;
pub mod errors;
pub mod routes;
pub mod state;
