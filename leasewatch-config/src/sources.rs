use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::models::{DownstreamBackend, StoreBackend};

/// Raw configuration as defined in a TOML file.
///
/// Durations are written the human way (`"30s"`, `"24h"`); a bare integer is
/// read as seconds.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub store: FileStoreConfig,
    #[serde(default)]
    pub upstream: FileUpstreamConfig,
    #[serde(default)]
    pub schedule: FileScheduleConfig,
    #[serde(default)]
    pub lease: FileLeaseConfig,
    #[serde(default)]
    pub poller: FilePollerConfig,
    #[serde(default)]
    pub credentials: FileCredentialConfig,
    #[serde(default)]
    pub rate_limit: FileRateLimitConfig,
    #[serde(default)]
    pub dispatch: FileDispatchConfig,
    #[serde(default)]
    pub downstream: FileDownstreamConfig,
    #[serde(default)]
    pub admin: FileAdminConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<StoreBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileUpstreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileScheduleConfig {
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub invocation_deadline: Option<Duration>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub claim_wait: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_claim_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_concurrency: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLeaseConfig {
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub watch_ttl: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_on_cycle: Option<bool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FilePollerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCredentialConfig {
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub safety_margin: Option<Duration>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRateLimitConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls_per_window: Option<u32>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub window: Option<Duration>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub acquire_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tenants: BTreeMap<String, FileRateLimitOverride>,
}

/// Per-tenant override; unset fields inherit the section defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRateLimitOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls_per_window: Option<u32>,
    #[serde(
        default,
        with = "humantime_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub window: Option<Duration>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDispatchConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_tenant_concurrency: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDownstreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<DownstreamBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_key: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileAdminConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// Environment-derived configuration values.
///
/// Values stay raw here; the loader parses them so a malformed variable is
/// reported with its name instead of being silently ignored.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub store_backend: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<String>,
    pub upstream_base_url: Option<String>,
    pub upstream_token_url: Option<String>,
    pub upstream_client_id: Option<String>,
    pub upstream_client_secret: Option<String>,
    pub upstream_request_timeout: Option<String>,
    pub schedule_interval: Option<String>,
    pub invocation_deadline: Option<String>,
    pub claim_wait: Option<String>,
    pub lease_duration: Option<String>,
    pub lease_batch_size: Option<String>,
    pub watch_ttl: Option<String>,
    pub downstream_backend: Option<String>,
    pub redis_url: Option<String>,
    pub queue_key: Option<String>,
    pub admin_enabled: Option<bool>,
    pub admin_host: Option<String>,
    pub admin_port: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty_var("LEASEWATCH_CONFIG").map(PathBuf::from),
            store_backend: non_empty_var("LEASEWATCH_STORE_BACKEND"),
            database_url: non_empty_var("DATABASE_URL"),
            database_max_connections: non_empty_var(
                "DATABASE_MAX_CONNECTIONS",
            ),
            upstream_base_url: non_empty_var("LEASEWATCH_UPSTREAM_BASE_URL"),
            upstream_token_url: non_empty_var("LEASEWATCH_UPSTREAM_TOKEN_URL"),
            upstream_client_id: non_empty_var("LEASEWATCH_UPSTREAM_CLIENT_ID"),
            upstream_client_secret: non_empty_var(
                "LEASEWATCH_UPSTREAM_CLIENT_SECRET",
            ),
            upstream_request_timeout: non_empty_var(
                "LEASEWATCH_UPSTREAM_REQUEST_TIMEOUT",
            ),
            schedule_interval: non_empty_var("LEASEWATCH_SCHEDULE_INTERVAL"),
            invocation_deadline: non_empty_var(
                "LEASEWATCH_INVOCATION_DEADLINE",
            ),
            claim_wait: non_empty_var("LEASEWATCH_CLAIM_WAIT"),
            lease_duration: non_empty_var("LEASEWATCH_LEASE_DURATION"),
            lease_batch_size: non_empty_var("LEASEWATCH_LEASE_BATCH_SIZE"),
            watch_ttl: non_empty_var("LEASEWATCH_WATCH_TTL"),
            downstream_backend: non_empty_var("LEASEWATCH_DOWNSTREAM_BACKEND"),
            redis_url: non_empty_var("REDIS_URL"),
            queue_key: non_empty_var("LEASEWATCH_QUEUE_KEY"),
            admin_enabled: parse_bool_var("LEASEWATCH_ADMIN_ENABLED"),
            admin_host: non_empty_var("LEASEWATCH_ADMIN_HOST"),
            admin_port: non_empty_var("LEASEWATCH_ADMIN_PORT"),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_bool_var(name: &str) -> Option<bool> {
    std::env::var(name).ok().and_then(|raw| {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

/// Serde adapter for optional durations written as `"90s"`/`"5m"` or as an
/// integer number of seconds.
pub(crate) mod humantime_value {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_str(
                &humantime::format_duration(*duration).to_string(),
            ),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Seconds(secs)) => Ok(Some(Duration::from_secs(secs))),
            Some(Raw::Text(text)) => humantime::parse_duration(text.trim())
                .map(Some)
                .map_err(|err| {
                    de::Error::custom(format!(
                        "invalid duration `{text}`: {err}"
                    ))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_human_strings_and_bare_seconds() {
        let parsed: FileConfig = toml::from_str(
            r#"
            [schedule]
            interval = "2m"
            claim_wait = 15

            [lease]
            watch_ttl = "12h"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.schedule.interval, Some(Duration::from_secs(120)));
        assert_eq!(parsed.schedule.claim_wait, Some(Duration::from_secs(15)));
        assert_eq!(
            parsed.lease.watch_ttl,
            Some(Duration::from_secs(12 * 60 * 60))
        );
        assert_eq!(parsed.lease.duration, None);
    }

    #[test]
    fn malformed_duration_is_a_parse_error() {
        let err = toml::from_str::<FileConfig>(
            r#"
            [lease]
            duration = "thirty seconds"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid duration"));
    }

    #[test]
    fn tenant_overrides_deserialize_by_id() {
        let parsed: FileConfig = toml::from_str(
            r#"
            [rate_limit]
            calls_per_window = 20

            [rate_limit.tenants.firm-slow]
            calls_per_window = 1
            window = "10s"
            "#,
        )
        .unwrap();

        let slow = &parsed.rate_limit.tenants["firm-slow"];
        assert_eq!(slow.calls_per_window, Some(1));
        assert_eq!(slow.window, Some(Duration::from_secs(10)));
    }
}
