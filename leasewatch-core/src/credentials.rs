//! Per-tenant access token validation and renewal.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use leasewatch_model::{Credential, SecretToken, TenantId};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{info, instrument, warn};
use url::Url;

use crate::{
    error::{PollError, Result},
    store::LeaseStore,
    time::TimeProvider,
    upstream::transport_error,
};

/// Fresh token material from the authorization server.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub access_token: SecretToken,
    /// Rotated refresh token. `None` keeps the stored one.
    pub refresh_token: Option<SecretToken>,
    pub expires_in: Duration,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(
        &self,
        tenant_id: &TenantId,
        refresh_token: &SecretToken,
    ) -> Result<TokenGrant>;
}

/// OAuth2 `grant_type=refresh_token` exchange.
#[derive(Clone)]
pub struct OAuthTokenEndpoint {
    client: Client,
    token_url: Url,
    client_id: String,
    client_secret: Option<SecretToken>,
}

impl std::fmt::Debug for OAuthTokenEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthTokenEndpoint")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("has_client_secret", &self.client_secret.is_some())
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: u64,
}

impl OAuthTokenEndpoint {
    pub fn new(
        token_url: Url,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| PollError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            token_url,
            client_id: client_id.into(),
            client_secret: client_secret.map(SecretToken::new),
        })
    }
}

#[async_trait]
impl TokenEndpoint for OAuthTokenEndpoint {
    async fn refresh(
        &self,
        tenant_id: &TenantId,
        refresh_token: &SecretToken,
    ) -> Result<TokenGrant> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.expose()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.expose()));
        }

        let response = self
            .client
            .post(self.token_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(PollError::TransientUpstream(format!(
                "token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(PollError::credential(
                tenant_id,
                format!("token refresh rejected ({status})"),
            ));
        }

        let body: TokenResponse = response.json().await.map_err(transport_error)?;
        Ok(TokenGrant {
            access_token: SecretToken::new(body.access_token),
            refresh_token: body.refresh_token.map(SecretToken::new),
            expires_in: Duration::from_secs(body.expires_in),
        })
    }
}

/// Keeps every polled tenant's access token valid for at least the safety
/// margin.
#[derive(Clone)]
pub struct CredentialRefresher {
    store: Arc<dyn LeaseStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    time: Arc<dyn TimeProvider>,
    safety_margin: Duration,
}

impl std::fmt::Debug for CredentialRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRefresher")
            .field("safety_margin", &self.safety_margin)
            .finish_non_exhaustive()
    }
}

impl CredentialRefresher {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        time: Arc<dyn TimeProvider>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            store,
            endpoint,
            time,
            safety_margin,
        }
    }

    /// Return a credential valid for at least the safety margin, refreshing
    /// and persisting it first when needed.
    #[instrument(
        name = "credentials.ensure_fresh",
        skip_all,
        fields(tenant = %tenant_id)
    )]
    pub async fn ensure_fresh(&self, tenant_id: &TenantId) -> Result<Credential> {
        let margin = chrono::Duration::from_std(self.safety_margin)
            .map_err(|e| PollError::Config(format!("safety margin out of range: {e}")))?;

        let Some(current) = self.store.get_credential(tenant_id).await? else {
            return Err(PollError::credential(tenant_id, "no credential stored"));
        };

        if !current.needs_refresh(self.time.utc_now(), margin) {
            return Ok(current);
        }

        let Some(refresh_token) = current.refresh_token.as_ref() else {
            return Err(PollError::credential(
                tenant_id,
                "access token expiring and no refresh token stored",
            ));
        };

        let grant = match self.endpoint.refresh(tenant_id, refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                warn!(
                    target: "leasewatch::credentials",
                    tenant = %tenant_id,
                    error.kind = err.kind(),
                    error = %err,
                    "token refresh failed"
                );
                return Err(err);
            }
        };

        if grant.expires_in <= self.safety_margin {
            return Err(PollError::credential(
                tenant_id,
                format!(
                    "refreshed token lifetime {}s does not cover the safety margin",
                    grant.expires_in.as_secs()
                ),
            ));
        }

        let expires_at = chrono::Duration::from_std(grant.expires_in)
            .ok()
            .and_then(|expires_in| self.time.utc_now().checked_add_signed(expires_in))
            .ok_or_else(|| {
                PollError::credential(
                    tenant_id,
                    format!(
                        "refreshed token lifetime {}s is out of range",
                        grant.expires_in.as_secs()
                    ),
                )
            })?;
        let refreshed = Credential {
            tenant_id: tenant_id.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| current.refresh_token.clone()),
            expires_at: Some(expires_at),
        };
        self.store.put_credential(&refreshed).await?;

        info!(
            target: "leasewatch::credentials",
            tenant = %tenant_id,
            expires_at = ?refreshed.expires_at,
            "access token refreshed"
        );
        Ok(refreshed)
    }
}
