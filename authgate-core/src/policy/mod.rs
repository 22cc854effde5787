//! Policy decisions from the remote IAM service.
//!
//! Each ACL-checked request issues exactly one query. Decisions are never
//! cached, and every error resolves to deny at the call site.

mod iam;
mod mock;

pub use iam::IamPolicyClient;
pub use mock::{PolicyOutcome, PolicyQuery, RecordingPolicyClient};

use std::time::Duration;
use thiserror::Error;

/// Outcome of a single policy query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allow: bool,
}

impl PolicyDecision {
    pub const ALLOW: PolicyDecision = PolicyDecision { allow: true };
    pub const DENY: PolicyDecision = PolicyDecision { allow: false };
}

/// Why a policy query produced no decision.
///
/// Callers treat all of these as deny; they stay distinct so logs can tell a
/// broken IAM service from an explicit refusal.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy query timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("policy service unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("policy service returned HTTP {status}")]
    UnexpectedStatus { status: u16 },

    #[error("malformed policy response: {reason}")]
    MalformedResponse { reason: String },

    #[error("policy query failed: {reason}")]
    Transport { reason: String },

    #[error("policy client setup failed: {reason}")]
    Client { reason: String },
}

impl PolicyError {
    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            PolicyError::Timeout { .. } => "timeout",
            PolicyError::Unreachable { .. } => "unreachable",
            PolicyError::UnexpectedStatus { .. } => "unexpected_status",
            PolicyError::MalformedResponse { .. } => "malformed_response",
            PolicyError::Transport { .. } => "transport",
            PolicyError::Client { .. } => "client",
        }
    }
}

/// Asks whether `uid` may act on `resource_id`.
///
/// Implementations carry only the identity and the resource id; request
/// headers never reach this interface.
#[async_trait::async_trait]
pub trait PolicyClient: Send + Sync {
    async fn query(
        &self,
        uid: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<PolicyDecision, PolicyError>;
}
