//! Recording policy client for tests and local runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use super::{PolicyClient, PolicyDecision, PolicyError};

/// What the recording client answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyOutcome {
    Allow,
    Deny,
    Timeout,
    Unreachable,
}

/// One query as seen by [`RecordingPolicyClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyQuery {
    pub uid: String,
    pub resource_id: String,
    pub timeout: Duration,
}

/// Policy client that answers from a fixed table and records every call.
#[derive(Debug)]
pub struct RecordingPolicyClient {
    default: PolicyOutcome,
    overrides: HashMap<(String, String), PolicyOutcome>,
    calls: Mutex<Vec<PolicyQuery>>,
}

impl RecordingPolicyClient {
    pub fn new(default: PolicyOutcome) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn allow_all() -> Self {
        Self::new(PolicyOutcome::Allow)
    }

    pub fn deny_all() -> Self {
        Self::new(PolicyOutcome::Deny)
    }

    /// Answer `outcome` for this exact (uid, resource id) pair.
    pub fn with_rule(
        mut self,
        uid: impl Into<String>,
        resource_id: impl Into<String>,
        outcome: PolicyOutcome,
    ) -> Self {
        self.overrides
            .insert((uid.into(), resource_id.into()), outcome);
        self
    }

    /// All queries received so far, in order.
    pub fn calls(&self) -> Vec<PolicyQuery> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl PolicyClient for RecordingPolicyClient {
    async fn query(
        &self,
        uid: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<PolicyDecision, PolicyError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(PolicyQuery {
                uid: uid.to_string(),
                resource_id: resource_id.to_string(),
                timeout,
            });
        }

        let outcome = self
            .overrides
            .get(&(uid.to_string(), resource_id.to_string()))
            .copied()
            .unwrap_or(self.default);

        match outcome {
            PolicyOutcome::Allow => Ok(PolicyDecision::ALLOW),
            PolicyOutcome::Deny => Ok(PolicyDecision::DENY),
            PolicyOutcome::Timeout => Err(PolicyError::Timeout { timeout }),
            PolicyOutcome::Unreachable => Err(PolicyError::Unreachable {
                reason: "connection refused".to_string(),
            }),
        }
    }
}
