//! Metadata policy engine.
//!
//! Implements the OpenID Federation 1.0 metadata-policy combinators
//! (`value`, `add`, `default`, `one_of`, `subset_of`, `superset_of`,
//! `essential`) as two pure functions over JSON values:
//!
//! - `merge` — combine a superior's policy with a subordinate's
//! - `apply` — project a policy onto a metadata document
//!
//! The same engine runs at admission time (can this entity's policy and
//! metadata live under ours?) and at resolve time (produce the effective
//! metadata).

mod apply;
mod merge;

pub use apply::apply_policy;
pub use merge::merge_policies;

/// Errors produced by the policy engine. Merging only ever reports
/// conflicts; application only ever reports violations.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy merge conflict: {0}")]
    MergeConflict(String),
    #[error("policy violation: {0}")]
    Violation(String),
}

impl From<PolicyError> for crate::error::FederationError {
    fn from(e: PolicyError) -> Self {
        match e {
            PolicyError::MergeConflict(msg) => {
                crate::error::FederationError::PolicyMergeConflict(msg)
            }
            PolicyError::Violation(msg) => crate::error::FederationError::PolicyViolation(msg),
        }
    }
}

pub(crate) const OPERATORS: &[&str] = &[
    "value",
    "add",
    "default",
    "one_of",
    "subset_of",
    "superset_of",
    "essential",
];
