use crate::catalog::CatalogViolation;

/// Errors surfaced by the escalation engine.
///
/// Trade rejections are not errors: they come back as
/// [`AuthorizationResult::Rejected`](crate::gate::AuthorizationResult).
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("invalid level: {0}")]
    InvalidLevel(String),
    #[error("catalog invariant violated: {0}")]
    InvariantViolation(CatalogViolation),
    #[error("performance snapshot unavailable: {0}")]
    SnapshotUnavailable(String),
    #[error("level pointer for agent {agent_id} changed concurrently (expected version {expected}, found {found})")]
    ConcurrentModification {
        agent_id: String,
        expected: u64,
        found: u64,
    },
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("user {user_id} lacks permission {permission}")]
    PermissionDenied { user_id: String, permission: String },
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl From<CatalogViolation> for EscalationError {
    fn from(v: CatalogViolation) -> Self {
        EscalationError::InvariantViolation(v)
    }
}
