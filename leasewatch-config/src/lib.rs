//! Configuration for the leasewatch polling orchestrator.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables (a `.env` file is honoured). The resolved
//! [`Config`] is checked by guard rails that reject unsafe combinations and
//! collect advisory [`ConfigWarnings`].
#![allow(missing_docs)]

pub mod loader;
pub mod models;
pub mod sources;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoadError, ConfigLoader, ConfigLoaderOptions};
pub use models::{
    AdminConfig, Config, ConfigMetadata, CredentialConfig, DispatchConfig,
    DownstreamBackend, DownstreamConfig, LeaseConfig, PollerConfig,
    RateLimitConfig, RateLimitPolicy, ScheduleConfig, StoreBackend, StoreConfig,
    UpstreamConfig,
};
pub use sources::{EnvConfig, FileConfig};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
