//! Operator endpoints: tenant registry, credential seeding and manual re-poll.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use leasewatch_core::orchestrator::CycleReport;
use leasewatch_model::{Credential, SecretToken, Tenant, TenantId};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::{
    errors::{AppError, AppResult},
    state::AppState,
};

pub fn create_admin_router() -> Router<AppState> {
    Router::new()
        .route("/tenants", get(list_tenants))
        .route("/tenants/{id}", put(upsert_tenant))
        .route("/tenants/{id}/credential", put(put_credential))
        .route("/tenants/{id}/repoll", post(repoll_tenant))
}

/// Liveness plus a round trip to the lease store.
pub async fn health(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let active = state
        .store()
        .active_tenants()
        .await
        .map_err(|e| AppError::unavailable(format!("lease store unreachable: {e}")))?;
    Ok(Json(json!({
        "status": "ok",
        "active_tenants": active.len(),
        "time": Utc::now(),
    })))
}

async fn list_tenants(State(state): State<AppState>) -> AppResult<Json<Vec<Tenant>>> {
    Ok(Json(state.store().list_tenants().await?))
}

#[derive(Debug, Deserialize)]
pub struct TenantUpdate {
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

async fn upsert_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<TenantUpdate>,
) -> AppResult<Json<Tenant>> {
    let tenant_id = TenantId::new(id)?;
    let tenant = state.store().upsert_tenant(&tenant_id, update.active).await?;
    info!(tenant = %tenant_id, active = tenant.active, "tenant registry updated");
    Ok(Json(tenant))
}

#[derive(Deserialize)]
pub struct CredentialUpdate {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for CredentialUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialUpdate")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

async fn put_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<CredentialUpdate>,
) -> AppResult<StatusCode> {
    let tenant_id = TenantId::new(id)?;
    if state.store().get_tenant(&tenant_id).await?.is_none() {
        return Err(AppError::not_found(format!("tenant {tenant_id} is not registered")));
    }

    state
        .store()
        .put_credential(&Credential {
            tenant_id: tenant_id.clone(),
            access_token: SecretToken::new(update.access_token),
            refresh_token: update.refresh_token.map(SecretToken::new),
            expires_at: update.expires_at,
        })
        .await?;
    info!(target: "leasewatch::credentials", tenant = %tenant_id, "credential replaced");
    Ok(StatusCode::NO_CONTENT)
}

async fn repoll_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<CycleReport>> {
    let tenant_id = TenantId::new(id)?;
    info!(tenant = %tenant_id, "manual re-poll requested");
    state
        .orchestrator
        .repoll_tenant(&tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("tenant {tenant_id} is not registered")))
}
