use std::{collections::BTreeMap, fmt, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

/// Fully resolved runtime configuration.
///
/// Every section carries defaults so a deployment only has to spell out the
/// upstream endpoints and whatever it wants to tune.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub upstream: UpstreamConfig,
    pub schedule: ScheduleConfig,
    pub lease: LeaseConfig,
    pub poller: PollerConfig,
    pub credentials: CredentialConfig,
    pub rate_limit: RateLimitConfig,
    pub dispatch: DispatchConfig,
    pub downstream: DownstreamConfig,
    pub admin: AdminConfig,
    pub metadata: ConfigMetadata,
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps. Only safe with a single process.
    #[default]
    Memory,
    Postgres,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    /// Pool size for the postgres backend.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

/// Upstream resource API and its authorization endpoint.
#[derive(Clone)]
pub struct UpstreamConfig {
    pub base_url: Option<Url>,
    pub token_url: Option<Url>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Per-request timeout for both the resource API and the token endpoint.
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token_url: None,
            client_id: None,
            client_secret: None,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("token_url", &self.token_url.as_ref().map(Url::as_str))
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Recurring trigger and per-invocation budget.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    /// Wall-clock interval between invocations. Invocations start on every
    /// tick whether or not the previous one finished.
    pub interval: Duration,
    /// Hard deadline for one invocation. Work still running is abandoned and
    /// its leases expire on their own.
    pub invocation_deadline: Duration,
    /// Pause between claim/dispatch iterations.
    pub claim_wait: Duration,
    /// Upper bound on claim/dispatch iterations per invocation.
    pub max_claim_iterations: u32,
    /// Tenants refreshed and polled in parallel.
    pub poll_concurrency: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            invocation_deadline: Duration::from_secs(55),
            claim_wait: Duration::from_secs(20),
            max_claim_iterations: 3,
            poll_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    /// How long a claim stays exclusive.
    pub duration: Duration,
    /// Records claimed per tenant and kind in one iteration.
    pub batch_size: usize,
    /// Lifetime of a watch record from (re)discovery.
    pub watch_ttl: Duration,
    /// Purge TTL-expired records at the end of each invocation.
    pub sweep_on_cycle: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            batch_size: 50,
            watch_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_on_cycle: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub page_size: u32,
    /// Pages fetched per tenant before the poll is treated as partial.
    pub max_pages: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 20,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CredentialConfig {
    /// Tokens expiring within this margin are refreshed before use.
    pub safety_margin: Duration,
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(5 * 60),
        }
    }
}

/// Calls allowed per fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub calls_per_window: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub calls_per_window: u32,
    pub window: Duration,
    /// Longest a caller waits for a permit before deferring.
    pub acquire_timeout: Duration,
    /// Per-tenant overrides keyed by tenant id.
    pub tenants: BTreeMap<String, RateLimitPolicy>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_window: 10,
            window: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(2),
            tenants: BTreeMap::new(),
        }
    }
}

impl RateLimitConfig {
    pub fn default_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            calls_per_window: self.calls_per_window,
            window: self.window,
        }
    }

    pub fn policy_for(&self, tenant_id: &str) -> RateLimitPolicy {
        self.tenants
            .get(tenant_id)
            .copied()
            .unwrap_or_else(|| self.default_policy())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub global_concurrency: usize,
    pub per_tenant_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 16,
            per_tenant_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownstreamBackend {
    /// Emit dispatch messages as log lines only.
    #[default]
    Log,
    Redis,
}

impl FromStr for DownstreamBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(DownstreamBackend::Log),
            "redis" => Ok(DownstreamBackend::Redis),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownstreamConfig {
    pub backend: DownstreamBackend,
    pub redis_url: Option<String>,
    /// Redis list receiving dispatch messages.
    pub queue_key: String,
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            backend: DownstreamBackend::Log,
            redis_url: None,
            queue_key: "leasewatch:dispatch".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8089,
        }
    }
}

impl AdminConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
