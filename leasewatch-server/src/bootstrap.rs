//! Wires configured backends into an [`Orchestrator`].

use std::sync::Arc;

use anyhow::{Context, bail};
use leasewatch_config::{
    Config, DownstreamBackend, DownstreamConfig, StoreBackend, StoreConfig, UpstreamConfig,
};
use leasewatch_core::{
    credentials::{OAuthTokenEndpoint, TokenEndpoint},
    dispatch::{DownstreamQueue, LogDownstreamQueue, RedisDownstreamQueue},
    orchestrator::{Collaborators, Orchestrator},
    store::{InMemoryLeaseStore, LeaseStore, PostgresLeaseStore},
    time::SystemTimeProvider,
    upstream::{HttpUpstreamClient, UpstreamClient},
};
use tracing::{info, warn};

pub async fn connect_postgres(config: &StoreConfig) -> anyhow::Result<PostgresLeaseStore> {
    let url = config
        .database_url
        .as_deref()
        .context("store.database_url (DATABASE_URL) is not set")?;
    PostgresLeaseStore::connect(url, config.max_connections)
        .await
        .context("failed to connect to PostgreSQL lease store")
}

pub async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn LeaseStore>> {
    match config.backend {
        StoreBackend::Memory => {
            warn!(
                target: "leasewatch::lease",
                "using the in-memory lease store; leases are not shared across processes"
            );
            Ok(Arc::new(InMemoryLeaseStore::new()))
        }
        StoreBackend::Postgres => Ok(Arc::new(connect_postgres(config).await?)),
    }
}

pub async fn connect_queue(config: &DownstreamConfig) -> anyhow::Result<Arc<dyn DownstreamQueue>> {
    match config.backend {
        DownstreamBackend::Log => Ok(Arc::new(LogDownstreamQueue)),
        DownstreamBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .context("downstream.redis_url (REDIS_URL) is not set")?;
            let queue = RedisDownstreamQueue::connect(url, config.queue_key.clone())
                .await
                .context("failed to connect to Redis downstream queue")?;
            Ok(Arc::new(queue))
        }
    }
}

pub fn upstream_client(config: &UpstreamConfig) -> anyhow::Result<Arc<dyn UpstreamClient>> {
    let base_url = config
        .base_url
        .clone()
        .context("upstream.base_url (LEASEWATCH_UPSTREAM_BASE_URL) is not set")?;
    let client = HttpUpstreamClient::new(base_url, config.request_timeout)
        .context("failed to build upstream client")?;
    Ok(Arc::new(client))
}

pub fn token_endpoint(config: &UpstreamConfig) -> anyhow::Result<Arc<dyn TokenEndpoint>> {
    let token_url = config
        .token_url
        .clone()
        .context("upstream.token_url (LEASEWATCH_UPSTREAM_TOKEN_URL) is not set")?;
    let Some(client_id) = config.client_id.clone() else {
        bail!("upstream.client_id (LEASEWATCH_UPSTREAM_CLIENT_ID) is not set");
    };
    let endpoint = OAuthTokenEndpoint::new(
        token_url,
        client_id,
        config.client_secret.clone(),
        config.request_timeout,
    )
    .context("failed to build token endpoint client")?;
    Ok(Arc::new(endpoint))
}

pub async fn build_orchestrator(config: &Config) -> anyhow::Result<Arc<Orchestrator>> {
    let store = connect_store(&config.store).await?;
    let queue = connect_queue(&config.downstream).await?;
    let upstream = upstream_client(&config.upstream)?;
    let tokens = token_endpoint(&config.upstream)?;

    info!(
        store = ?config.store.backend,
        downstream = ?config.downstream.backend,
        "orchestrator wired"
    );

    Ok(Arc::new(Orchestrator::new(
        config,
        Collaborators {
            store,
            upstream,
            tokens,
            queue,
            time: Arc::new(SystemTimeProvider),
            classifier: None,
        },
    )))
}
