//! Error kinds shared across the workspace.

use thiserror::Error;

/// Errors that can occur in the shardman coordination plane.
///
/// These are kinds, not component-specific types: every crate in the
/// workspace speaks `SmError` so callers can match on the kind regardless
/// of which layer produced it.
#[derive(Debug, Error)]
pub enum SmError {
    /// Operation attempted on a component in shutdown. Callers retry later
    /// or abort.
    #[error("component is closing")]
    Closing,

    /// Map operation on an absent entry. Idempotent callers treat this as
    /// success.
    #[error("not exist")]
    NotExist,

    /// Map operation on a present entry. Idempotent callers treat this as
    /// success.
    #[error("already exist")]
    Exist,

    /// Retryable KV failure. Retried with bounded exponential backoff.
    #[error("transient kv error: {0}")]
    TransientKv(String),

    /// The session lease expired. Triggers leader re-election or worker
    /// re-register.
    #[error("session lost")]
    SessionLost,

    /// Bad input at construction. Fatal.
    #[error("config error: {0}")]
    Config(String),

    /// No assignment satisfies the constraints. Logged; a partial plan is
    /// published and the excess shards stay unassigned.
    #[error("planner infeasible: {0}")]
    PlannerInfeasible(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl SmError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SmError::TransientKv(_))
    }
}

impl From<etcd_client::Error> for SmError {
    fn from(err: etcd_client::Error) -> Self {
        SmError::TransientKv(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(SmError::TransientKv("timeout".into()).is_transient());
        assert!(!SmError::Closing.is_transient());
        assert!(!SmError::SessionLost.is_transient());
        assert!(!SmError::Config("missing id".into()).is_transient());
    }

    #[test]
    fn etcd_errors_map_to_transient() {
        let err: SmError = etcd_client::Error::InvalidArgs("bad key".into()).into();
        assert!(err.is_transient());
    }
}
