use leasewatch_model::{ModelError, TenantId};
use thiserror::Error;

/// Failure taxonomy for one polling/dispatch cycle.
///
/// Failures are isolated at the smallest unit that produced them: a tenant
/// step or a single record. Only `StoreUnavailable` during tenant discovery
/// aborts a whole invocation.
#[derive(Error, Debug)]
pub enum PollError {
    /// Rate limited, network failure, timeout or upstream 5xx. The next
    /// cycle retries.
    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    /// Refresh failed, credential missing, or upstream rejected the token.
    #[error("credential failure for tenant {tenant}: {reason}")]
    Credential { tenant: TenantId, reason: String },

    /// Upstream refused a request for a reason other than auth or load.
    #[error("upstream rejected request with status {status}: {message}")]
    UpstreamRejected { status: u16, message: String },

    /// Another invocation won the conditional write. Claims report this as a
    /// `false`/`None` outcome; the variant exists for diagnostics.
    #[error("lease contention on {0}")]
    LeaseContention(String),

    #[error("poison record {0} expired while still pending")]
    PoisonRecord(String),

    #[error("lease store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("downstream queue failure: {0}")]
    Downstream(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PollError {
    /// Stable label used as the `error.kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::TransientUpstream(_) => "transient_upstream",
            PollError::Credential { .. } => "credential",
            PollError::UpstreamRejected { .. } => "upstream_rejected",
            PollError::LeaseContention(_) => "lease_contention",
            PollError::PoisonRecord(_) => "poison_record",
            PollError::StoreUnavailable(_) => "store_unavailable",
            PollError::Downstream(_) => "downstream",
            PollError::Config(_) => "config",
            PollError::Serialization(_) => "serialization",
        }
    }

    pub fn credential(tenant: &TenantId, reason: impl Into<String>) -> Self {
        PollError::Credential {
            tenant: tenant.clone(),
            reason: reason.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PollError::TransientUpstream(_))
    }
}

impl From<serde_json::Error> for PollError {
    fn from(err: serde_json::Error) -> Self {
        PollError::Serialization(err.to_string())
    }
}

impl From<ModelError> for PollError {
    fn from(err: ModelError) -> Self {
        PollError::Serialization(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PollError {
    fn from(err: sqlx::Error) -> Self {
        PollError::StoreUnavailable(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for PollError {
    fn from(err: redis::RedisError) -> Self {
        PollError::Downstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PollError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_labels() {
        let tenant = TenantId::new("firm-a").unwrap();
        assert_eq!(
            PollError::credential(&tenant, "refresh rejected").kind(),
            "credential"
        );
        assert_eq!(
            PollError::TransientUpstream("429".into()).kind(),
            "transient_upstream"
        );
        assert!(PollError::TransientUpstream("timeout".into()).is_transient());
        assert!(!PollError::StoreUnavailable("down".into()).is_transient());
    }

    #[test]
    fn credential_errors_name_the_tenant() {
        let tenant = TenantId::new("firm-b").unwrap();
        let err = PollError::credential(&tenant, "no credential stored");
        assert_eq!(
            err.to_string(),
            "credential failure for tenant firm-b: no credential stored"
        );
    }
}
