use once_cell::sync::Lazy;
use std::{collections::BTreeMap, fs, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use url::Url;

use crate::{
    models::{
        AdminConfig, Config, ConfigMetadata, CredentialConfig, DispatchConfig,
        DownstreamConfig, LeaseConfig, PollerConfig, RateLimitConfig,
        RateLimitPolicy, ScheduleConfig, StoreConfig, UpstreamConfig,
    },
    sources::{EnvConfig, FileConfig},
    validation::{self, ConfigGuardRailError, ConfigWarnings},
};

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("leasewatch.toml"),
        PathBuf::from("config/leasewatch.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Use these values instead of reading the process environment.
    pub env_override: Option<EnvConfig>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.options.env_override = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(
                |err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                },
            )?,
            None => {
                dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                    dotenvy::Error::Io(_) => Ok(false),
                    _ => Err(err),
                })?
            }
        };

        let env_config = self
            .options
            .env_override
            .clone()
            .unwrap_or_else(EnvConfig::gather);

        let (file_config, config_path) = self.load_file_config(&env_config)?;

        let (config, warnings) = compose_config(
            file_config,
            env_config,
            ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        )?;

        tracing::debug!(
            config_path = ?config.metadata.config_path,
            env_file_loaded = config.metadata.env_file_loaded,
            warnings = warnings.items.len(),
            "configuration loaded"
        );

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env_config: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = if let Some(path) = &self.options.config_path {
            (Some(path.clone()), true)
        } else if let Some(path) = &env_config.config_path {
            (Some(path.clone()), true)
        } else {
            let found = DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned();
            (found, false)
        };

        let Some(path) = path else {
            return Ok((None, None));
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents =
            fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
                path: path.clone(),
                source,
            })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| {
                ConfigLoadError::Parse {
                    path: path.clone(),
                    source,
                }
            })?;

        Ok((Some(file_config), Some(path)))
    }
}

/// Merge file and environment values over the defaults. Environment wins.
fn compose_config(
    file_config: Option<FileConfig>,
    env: EnvConfig,
    metadata: ConfigMetadata,
) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    if metadata.config_path.is_none() {
        warnings.push_with_hint(
            "No leasewatch.toml detected; using defaults and environment variables",
            "Pass --config or set LEASEWATCH_CONFIG to point at a configuration file",
        );
    }

    let FileConfig {
        store: file_store,
        upstream: file_upstream,
        schedule: file_schedule,
        lease: file_lease,
        poller: file_poller,
        credentials: file_credentials,
        rate_limit: file_rate_limit,
        dispatch: file_dispatch,
        downstream: file_downstream,
        admin: file_admin,
    } = file_config.unwrap_or_default();

    let store_defaults = StoreConfig::default();
    let store = StoreConfig {
        backend: match env.store_backend.as_deref() {
            Some(raw) => parse_backend("LEASEWATCH_STORE_BACKEND", raw)?,
            None => file_store.backend.unwrap_or(store_defaults.backend),
        },
        database_url: env.database_url.clone().or(file_store.database_url),
        max_connections: match env.database_max_connections.as_deref() {
            Some(raw) => parse_number("DATABASE_MAX_CONNECTIONS", raw)?,
            None => file_store
                .max_connections
                .unwrap_or(store_defaults.max_connections),
        },
    };

    let upstream_defaults = UpstreamConfig::default();
    let upstream = UpstreamConfig {
        base_url: parse_url(
            "upstream.base_url",
            env.upstream_base_url.clone().or(file_upstream.base_url),
        )?,
        token_url: parse_url(
            "upstream.token_url",
            env.upstream_token_url.clone().or(file_upstream.token_url),
        )?,
        client_id: env.upstream_client_id.clone().or(file_upstream.client_id),
        client_secret: env
            .upstream_client_secret
            .clone()
            .or(file_upstream.client_secret),
        request_timeout: resolve_duration(
            "LEASEWATCH_UPSTREAM_REQUEST_TIMEOUT",
            env.upstream_request_timeout.as_deref(),
            file_upstream.request_timeout,
            upstream_defaults.request_timeout,
        )?,
    };

    let schedule_defaults = ScheduleConfig::default();
    let schedule = ScheduleConfig {
        interval: resolve_duration(
            "LEASEWATCH_SCHEDULE_INTERVAL",
            env.schedule_interval.as_deref(),
            file_schedule.interval,
            schedule_defaults.interval,
        )?,
        invocation_deadline: resolve_duration(
            "LEASEWATCH_INVOCATION_DEADLINE",
            env.invocation_deadline.as_deref(),
            file_schedule.invocation_deadline,
            schedule_defaults.invocation_deadline,
        )?,
        claim_wait: resolve_duration(
            "LEASEWATCH_CLAIM_WAIT",
            env.claim_wait.as_deref(),
            file_schedule.claim_wait,
            schedule_defaults.claim_wait,
        )?,
        max_claim_iterations: file_schedule
            .max_claim_iterations
            .unwrap_or(schedule_defaults.max_claim_iterations),
        poll_concurrency: file_schedule
            .poll_concurrency
            .unwrap_or(schedule_defaults.poll_concurrency),
    };

    let lease_defaults = LeaseConfig::default();
    let lease = LeaseConfig {
        duration: resolve_duration(
            "LEASEWATCH_LEASE_DURATION",
            env.lease_duration.as_deref(),
            file_lease.duration,
            lease_defaults.duration,
        )?,
        batch_size: match env.lease_batch_size.as_deref() {
            Some(raw) => parse_number("LEASEWATCH_LEASE_BATCH_SIZE", raw)?,
            None => file_lease.batch_size.unwrap_or(lease_defaults.batch_size),
        },
        watch_ttl: resolve_duration(
            "LEASEWATCH_WATCH_TTL",
            env.watch_ttl.as_deref(),
            file_lease.watch_ttl,
            lease_defaults.watch_ttl,
        )?,
        sweep_on_cycle: file_lease
            .sweep_on_cycle
            .unwrap_or(lease_defaults.sweep_on_cycle),
    };

    let poller_defaults = PollerConfig::default();
    let poller = PollerConfig {
        page_size: file_poller.page_size.unwrap_or(poller_defaults.page_size),
        max_pages: file_poller.max_pages.unwrap_or(poller_defaults.max_pages),
    };

    let credentials = CredentialConfig {
        safety_margin: file_credentials
            .safety_margin
            .unwrap_or(CredentialConfig::default().safety_margin),
    };

    let rate_defaults = RateLimitConfig::default();
    let calls_per_window = file_rate_limit
        .calls_per_window
        .unwrap_or(rate_defaults.calls_per_window);
    let window = file_rate_limit.window.unwrap_or(rate_defaults.window);
    let tenants: BTreeMap<String, RateLimitPolicy> = file_rate_limit
        .tenants
        .into_iter()
        .map(|(tenant, policy)| {
            (
                tenant,
                RateLimitPolicy {
                    calls_per_window: policy
                        .calls_per_window
                        .unwrap_or(calls_per_window),
                    window: policy.window.unwrap_or(window),
                },
            )
        })
        .collect();
    let rate_limit = RateLimitConfig {
        calls_per_window,
        window,
        acquire_timeout: file_rate_limit
            .acquire_timeout
            .unwrap_or(rate_defaults.acquire_timeout),
        tenants,
    };

    let dispatch_defaults = DispatchConfig::default();
    let dispatch = DispatchConfig {
        global_concurrency: file_dispatch
            .global_concurrency
            .unwrap_or(dispatch_defaults.global_concurrency),
        per_tenant_concurrency: file_dispatch
            .per_tenant_concurrency
            .unwrap_or(dispatch_defaults.per_tenant_concurrency),
    };

    let downstream_defaults = DownstreamConfig::default();
    let downstream = DownstreamConfig {
        backend: match env.downstream_backend.as_deref() {
            Some(raw) => parse_backend("LEASEWATCH_DOWNSTREAM_BACKEND", raw)?,
            None => file_downstream
                .backend
                .unwrap_or(downstream_defaults.backend),
        },
        redis_url: env.redis_url.clone().or(file_downstream.redis_url),
        queue_key: env
            .queue_key
            .clone()
            .or(file_downstream.queue_key)
            .unwrap_or(downstream_defaults.queue_key),
    };

    let admin_defaults = AdminConfig::default();
    let admin = AdminConfig {
        enabled: env
            .admin_enabled
            .or(file_admin.enabled)
            .unwrap_or(admin_defaults.enabled),
        host: env
            .admin_host
            .clone()
            .or(file_admin.host)
            .unwrap_or(admin_defaults.host),
        port: match env.admin_port.as_deref() {
            Some(raw) => parse_number("LEASEWATCH_ADMIN_PORT", raw)?,
            None => file_admin.port.unwrap_or(admin_defaults.port),
        },
    };

    let config = Config {
        store,
        upstream,
        schedule,
        lease,
        poller,
        credentials,
        rate_limit,
        dispatch,
        downstream,
        admin,
        metadata,
    };

    let guard_warnings = validation::apply_guard_rails(&config)?;
    warnings.extend(guard_warnings);

    Ok((config, warnings))
}

fn resolve_duration(
    variable: &'static str,
    env_value: Option<&str>,
    file_value: Option<Duration>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match env_value {
        Some(raw) => humantime::parse_duration(raw).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                variable,
                value: raw.to_string(),
                source,
            }
        }),
        None => Ok(file_value.unwrap_or(default)),
    }
}

fn parse_number<T: FromStr>(
    variable: &'static str,
    raw: &str,
) -> Result<T, ConfigLoadError> {
    raw.parse().map_err(|_| ConfigLoadError::InvalidValue {
        variable,
        value: raw.to_string(),
    })
}

fn parse_backend<T: FromStr<Err = String>>(
    variable: &'static str,
    raw: &str,
) -> Result<T, ConfigLoadError> {
    raw.parse().map_err(|value| ConfigLoadError::InvalidValue { variable, value })
}

fn parse_url(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<Url>, ConfigLoadError> {
    raw.map(|raw| {
        Url::parse(raw.trim())
            .map_err(|source| ConfigLoadError::InvalidUrl { field, source })
    })
    .transpose()
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration `{value}` in {variable}")]
    InvalidDuration {
        variable: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid value `{value}` in {variable}")]
    InvalidValue {
        variable: &'static str,
        value: String,
    },
    #[error("invalid URL in {field}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
