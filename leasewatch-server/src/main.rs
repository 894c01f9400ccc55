//! `leasewatch-server` entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use leasewatch_config::{Config, ConfigLoad, ConfigLoader};
use leasewatch_core::orchestrator::ScheduleRunner;
use leasewatch_model::TenantId;
use leasewatch_server::{bootstrap, routes, state::AppState};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "leasewatch-server")]
#[command(about = "Lease-based polling orchestrator for multi-tenant upstream change feeds")]
struct Cli {
    /// Path to a TOML config file (overrides LEASEWATCH_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the recurring schedule and the admin API (default)
    Run,
    /// Run a single invocation across all active tenants and exit
    Once,
    /// Re-poll one tenant immediately and exit
    Trigger {
        /// Tenant to re-poll
        #[arg(long)]
        tenant: String,
    },
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply lease store migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_server(config).await,
        Command::Once => run_once(config).await,
        Command::Trigger { tenant } => run_trigger(config, tenant).await,
        Command::Db(DbCommand::Migrate) => run_db_migrate(config).await,
    }
}

fn load_runtime_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config.clone() {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.env_file.clone() {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad { config, warnings } =
        loader.load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Cycle summaries and lease activity at info. Override via RUST_LOG.
                "info,leasewatch::lease=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    match config.metadata.config_path.as_ref() {
        Some(path) => info!(path = %path.display(), "configuration file loaded"),
        None => info!("no configuration file; using defaults and environment"),
    }
    for warning in warnings.iter() {
        match &warning.hint {
            Some(hint) => {
                warn!(message = %warning.message, hint = %hint, "configuration warning")
            }
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    Ok(config)
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let orchestrator = bootstrap::build_orchestrator(&config).await?;
    let shutdown = CancellationToken::new();

    let schedule = tokio::spawn(
        ScheduleRunner::new(orchestrator.clone(), config.schedule.interval)
            .run(shutdown.child_token()),
    );

    let admin = if config.admin.enabled {
        let address = config.admin.bind_address();
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind admin API on {address}"))?;
        info!(%address, "admin API listening");

        let app = routes::create_router(AppState::new(orchestrator.clone()));
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        }))
    } else {
        info!("admin API disabled");
        None
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; waiting for in-flight invocations");
    shutdown.cancel();

    if let Err(err) = schedule.await {
        error!(error = %err, "schedule task panicked");
    }
    if let Some(admin) = admin {
        match admin.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "admin API stopped with an error"),
            Err(err) => error!(error = %err, "admin API task panicked"),
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn run_once(config: Config) -> anyhow::Result<()> {
    let orchestrator = bootstrap::build_orchestrator(&config).await?;
    let report = orchestrator
        .run_invocation()
        .await
        .context("invocation failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_trigger(config: Config, tenant: String) -> anyhow::Result<()> {
    let tenant_id = TenantId::new(tenant).context("invalid tenant id")?;
    let orchestrator = bootstrap::build_orchestrator(&config).await?;
    let report = orchestrator
        .repoll_tenant(&tenant_id)
        .await
        .with_context(|| format!("re-poll of {tenant_id} failed"))?
        .with_context(|| format!("tenant {tenant_id} is not registered"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_db_migrate(config: Config) -> anyhow::Result<()> {
    let store = bootstrap::connect_postgres(&config.store).await?;
    store
        .migrate()
        .await
        .context("failed to apply lease store migrations")?;
    info!("lease store migrations applied");
    Ok(())
}
