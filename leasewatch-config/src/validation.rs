use std::time::Duration;

use thiserror::Error;

use crate::models::{Config, DownstreamBackend, StoreBackend};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigGuardRailError {
    #[error(
        "lease.duration ({lease:?}) must be longer than schedule.claim_wait ({claim_wait:?})"
    )]
    LeaseShorterThanClaimWait {
        lease: Duration,
        claim_wait: Duration,
    },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: String },
    #[error("{field} ({value:?}) must not exceed {max:?}")]
    TooLarge {
        field: String,
        value: Duration,
        max: Duration,
    },
    #[error("store.backend = \"postgres\" requires store.database_url or DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("downstream.backend = \"redis\" requires downstream.redis_url or REDIS_URL")]
    MissingRedisUrl,
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(
        &mut self,
        message: S,
        hint: H,
    ) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigWarning> {
        self.items.iter()
    }
}

/// Upper bound for lease, TTL and refresh-margin durations. Larger values
/// overflow timestamp arithmetic long before they are meaningful.
pub const MAX_RETENTION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub fn apply_guard_rails(
    config: &Config,
) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    ensure_non_zero("lease.batch_size", config.lease.batch_size as u64)?;
    ensure_non_zero("poller.page_size", config.poller.page_size as u64)?;
    ensure_non_zero("poller.max_pages", config.poller.max_pages as u64)?;
    ensure_non_zero(
        "schedule.poll_concurrency",
        config.schedule.poll_concurrency as u64,
    )?;
    ensure_non_zero(
        "schedule.max_claim_iterations",
        config.schedule.max_claim_iterations as u64,
    )?;
    ensure_non_zero(
        "dispatch.global_concurrency",
        config.dispatch.global_concurrency as u64,
    )?;
    ensure_non_zero(
        "dispatch.per_tenant_concurrency",
        config.dispatch.per_tenant_concurrency as u64,
    )?;
    ensure_non_zero(
        "rate_limit.calls_per_window",
        config.rate_limit.calls_per_window as u64,
    )?;
    ensure_non_zero(
        "rate_limit.window",
        config.rate_limit.window.as_millis() as u64,
    )?;
    ensure_non_zero_duration("schedule.interval", config.schedule.interval)?;
    ensure_non_zero_duration(
        "schedule.invocation_deadline",
        config.schedule.invocation_deadline,
    )?;
    ensure_non_zero_duration("lease.watch_ttl", config.lease.watch_ttl)?;
    ensure_at_most("lease.duration", config.lease.duration, MAX_RETENTION)?;
    ensure_at_most("lease.watch_ttl", config.lease.watch_ttl, MAX_RETENTION)?;
    ensure_at_most(
        "credentials.safety_margin",
        config.credentials.safety_margin,
        MAX_RETENTION,
    )?;
    for (tenant, policy) in &config.rate_limit.tenants {
        ensure_non_zero(
            &format!("rate_limit.tenants.{tenant}.calls_per_window"),
            policy.calls_per_window as u64,
        )?;
        ensure_non_zero(
            &format!("rate_limit.tenants.{tenant}.window"),
            policy.window.as_millis() as u64,
        )?;
    }

    if config.lease.duration <= config.schedule.claim_wait {
        return Err(ConfigGuardRailError::LeaseShorterThanClaimWait {
            lease: config.lease.duration,
            claim_wait: config.schedule.claim_wait,
        });
    }

    if config.store.backend == StoreBackend::Postgres
        && config.store.database_url.is_none()
    {
        return Err(ConfigGuardRailError::MissingDatabaseUrl);
    }

    if config.downstream.backend == DownstreamBackend::Redis
        && config.downstream.redis_url.is_none()
    {
        return Err(ConfigGuardRailError::MissingRedisUrl);
    }

    if config.store.backend == StoreBackend::Memory {
        warnings.push_with_hint(
            "store.backend is memory; leases are not shared across processes",
            "Use the postgres backend when more than one process runs the schedule",
        );
    }

    if config.schedule.invocation_deadline > config.schedule.interval {
        warnings.push(format!(
            "schedule.invocation_deadline ({:?}) exceeds schedule.interval ({:?}); invocations will overlap",
            config.schedule.invocation_deadline, config.schedule.interval
        ));
    }

    if config.lease.duration
        < config.schedule.claim_wait + config.upstream.request_timeout
    {
        warnings.push_with_hint(
            "lease.duration is shorter than schedule.claim_wait plus upstream.request_timeout",
            "A slow dispatch may outlive its lease and be claimed again by an overlapping invocation",
        );
    }

    if config.upstream.base_url.is_none() || config.upstream.token_url.is_none()
    {
        warnings.push_with_hint(
            "upstream.base_url or upstream.token_url is not set; the poller cannot start",
            "Set LEASEWATCH_UPSTREAM_BASE_URL and LEASEWATCH_UPSTREAM_TOKEN_URL or add an [upstream] section",
        );
    }

    Ok(warnings)
}

fn ensure_non_zero(field: &str, value: u64) -> Result<(), ConfigGuardRailError> {
    if value == 0 {
        return Err(ConfigGuardRailError::ZeroValue {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn ensure_non_zero_duration(
    field: &str,
    value: Duration,
) -> Result<(), ConfigGuardRailError> {
    if value.is_zero() {
        return Err(ConfigGuardRailError::ZeroValue {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn ensure_at_most(
    field: &str,
    value: Duration,
    max: Duration,
) -> Result<(), ConfigGuardRailError> {
    if value > max {
        return Err(ConfigGuardRailError::TooLarge {
            field: field.to_string(),
            value,
            max,
        });
    }
    Ok(())
}
