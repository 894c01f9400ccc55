//! Loader tests. Each test injects its environment through `with_env` so the
//! process environment never leaks in and tests stay independent.

use std::{fs, path::Path, time::Duration};

use leasewatch_config::{
    ConfigGuardRailError, ConfigLoadError, ConfigLoader, DownstreamBackend,
    EnvConfig, StoreBackend,
};
use tempfile::TempDir;

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("leasewatch.toml");
    fs::write(&path, body).unwrap();
    path
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::new().with_env_file(dir.path().join("absent.env"))
}

#[test]
fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [upstream]
        base_url = "https://api.example.test/v1/"
        token_url = "https://auth.example.test/oauth/token"
        client_id = "leasewatch"

        [schedule]
        interval = "30s"
        claim_wait = "10s"

        [lease]
        duration = "45s"
        batch_size = 25
        watch_ttl = "6h"

        [rate_limit]
        calls_per_window = 5
        window = "10s"

        [rate_limit.tenants.firm-slow]
        calls_per_window = 1
        "#,
    );

    let load = loader(&dir)
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .unwrap();
    let config = load.config;

    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
    assert_eq!(config.schedule.interval, Duration::from_secs(30));
    assert_eq!(config.schedule.claim_wait, Duration::from_secs(10));
    assert_eq!(config.schedule.max_claim_iterations, 3);
    assert_eq!(config.lease.duration, Duration::from_secs(45));
    assert_eq!(config.lease.batch_size, 25);
    assert_eq!(config.lease.watch_ttl, Duration::from_secs(6 * 60 * 60));
    assert_eq!(config.poller.page_size, 100);

    let slow = config.rate_limit.policy_for("firm-slow");
    assert_eq!(slow.calls_per_window, 1);
    assert_eq!(slow.window, Duration::from_secs(10));
    assert_eq!(config.rate_limit.policy_for("firm-fast").calls_per_window, 5);

    assert_eq!(
        config.upstream.base_url.unwrap().as_str(),
        "https://api.example.test/v1/"
    );
    assert!(
        !load
            .warnings
            .iter()
            .any(|w| w.message.contains("No leasewatch.toml"))
    );
}

#[test]
fn environment_wins_over_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [store]
        backend = "memory"

        [lease]
        duration = "30s"

        [downstream]
        backend = "log"
        "#,
    );

    let env = EnvConfig {
        store_backend: Some("postgres".into()),
        database_url: Some("postgres://leasewatch@localhost/leasewatch".into()),
        lease_duration: Some("2m".into()),
        downstream_backend: Some("redis".into()),
        redis_url: Some("redis://127.0.0.1:6379".into()),
        admin_port: Some("9100".into()),
        ..EnvConfig::default()
    };

    let config = loader(&dir)
        .with_config_path(&path)
        .with_env(env)
        .load()
        .unwrap()
        .config;

    assert_eq!(config.store.backend, StoreBackend::Postgres);
    assert_eq!(config.lease.duration, Duration::from_secs(120));
    assert_eq!(config.downstream.backend, DownstreamBackend::Redis);
    assert_eq!(config.admin.port, 9100);
    assert_eq!(config.admin.bind_address(), "127.0.0.1:9100");
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = loader(&dir)
        .with_config_path(dir.path().join("nope.toml"))
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn no_file_falls_back_to_defaults_with_a_warning() {
    let dir = tempfile::tempdir().unwrap();
    let load = loader(&dir).with_env(EnvConfig::default()).load().unwrap();

    assert!(load.config.metadata.config_path.is_none());
    assert_eq!(load.config.schedule.interval, Duration::from_secs(60));
    assert!(
        load.warnings
            .iter()
            .any(|w| w.message.contains("No leasewatch.toml"))
    );
}

#[test]
fn malformed_env_duration_names_the_variable() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvConfig {
        claim_wait: Some("soon".into()),
        ..EnvConfig::default()
    };
    let err = loader(&dir).with_env(env).load().unwrap_err();
    match err {
        ConfigLoadError::InvalidDuration { variable, value, .. } => {
            assert_eq!(variable, "LEASEWATCH_CLAIM_WAIT");
            assert_eq!(value, "soon");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn guard_rails_reject_leases_shorter_than_the_wait() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [schedule]
        claim_wait = "40s"
        "#,
    );
    let err = loader(&dir)
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::GuardRail(
            ConfigGuardRailError::LeaseShorterThanClaimWait { .. }
        )
    ));
}

#[test]
fn guard_rails_reject_a_zero_schedule_interval() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        r#"
        [schedule]
        interval = "0s"
        "#,
    );
    let err = loader(&dir)
        .with_config_path(&path)
        .with_env(EnvConfig::default())
        .load()
        .unwrap_err();
    match err {
        ConfigLoadError::GuardRail(ConfigGuardRailError::ZeroValue { field }) => {
            assert_eq!(field, "schedule.interval");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn invalid_upstream_url_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let env = EnvConfig {
        upstream_base_url: Some("not a url".into()),
        ..EnvConfig::default()
    };
    let err = loader(&dir).with_env(env).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigLoadError::InvalidUrl {
            field: "upstream.base_url",
            ..
        }
    ));
}
