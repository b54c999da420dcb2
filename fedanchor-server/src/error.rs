//! Federation error taxonomy.
//!
//! Every failing operation reports exactly one of these kinds; the HTTP
//! layer maps them onto status codes and the public surface's
//! `{"error": ..., "error_description": ...}` body.

use fedanchor_jose::JoseError;

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    /// Outbound HTTP failed or returned non-2xx.
    #[error("fetch failed for {url}: {reason}")]
    FetchError { url: String, reason: String },

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("malformed JWS: {0}")]
    MalformedJws(String),

    /// The candidate's `authority_hints` does not list this trust anchor.
    #[error("trust anchor {0} is not in the entity's authority_hints")]
    AuthorityHintMissing(String),

    #[error("metadata policies cannot be merged: {0}")]
    PolicyMergeConflict(String),

    #[error("metadata violates policy: {0}")]
    PolicyViolation(String),

    #[error("valid_for {requested} exceeds the allowed maximum {limit}")]
    ValidForExceedsLimit { requested: i64, limit: i64 },

    /// A trust-mark field exceeds its type's bound.
    #[error("{field} exceeds the trust mark type's limit")]
    LimitExceeded { field: &'static str },

    #[error("trust mark type {0} not found")]
    TypeNotFound(i64),

    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness violation; the caller receives the existing row.
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("subordinate {0} is not active")]
    InactiveSubordinate(String),

    #[error("could not assemble a complete trust chain: {0}")]
    ChainIncomplete(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<JoseError> for FederationError {
    fn from(e: JoseError) -> Self {
        match e {
            JoseError::InvalidSignature | JoseError::UnknownKey => FederationError::InvalidSignature,
            JoseError::MalformedJws(msg) => FederationError::MalformedJws(msg),
            other => FederationError::MalformedJws(other.to_string()),
        }
    }
}

impl FederationError {
    /// Short machine-readable kind for the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            FederationError::FetchError { .. } => "fetch_error",
            FederationError::InvalidSignature => "invalid_signature",
            FederationError::MalformedJws(_) => "invalid_request",
            FederationError::AuthorityHintMissing(_) => "authority_hint_missing",
            FederationError::PolicyMergeConflict(_) => "policy_merge_conflict",
            FederationError::PolicyViolation(_) => "policy_violation",
            FederationError::ValidForExceedsLimit { .. } => "valid_for_exceeds_limit",
            FederationError::LimitExceeded { .. } => "limit_exceeded",
            FederationError::TypeNotFound(_) | FederationError::NotFound(_) => "not_found",
            FederationError::AlreadyExists(_) => "already_exists",
            FederationError::InactiveSubordinate(_) => "inactive_subordinate",
            FederationError::ChainIncomplete(_) => "chain_incomplete",
            FederationError::Store(_) | FederationError::Cache(_) | FederationError::Json(_) => {
                "server_error"
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FederationError>;
