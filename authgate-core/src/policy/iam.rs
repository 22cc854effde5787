//! HTTP policy client for the IAM policy query endpoint.
//!
//! Wire format:
//! `GET {iam.url}/acs/api/v1/internal/policyquery?rid=<rid>&uid=<uid>&action=<action>`
//! answered by `{"allowed": <bool>}`.

use reqwest::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{PolicyClient, PolicyDecision, PolicyError};
use crate::config::IamConfig;

const POLICY_QUERY_PATH: &str = "/acs/api/v1/internal/policyquery";

#[derive(Debug, Deserialize)]
struct PolicyQueryResponse {
    allowed: bool,
}

/// Policy client backed by the IAM service.
///
/// Requests are built from scratch for every query; nothing from the inbound
/// request is copied into them.
#[derive(Debug, Clone)]
pub struct IamPolicyClient {
    client: Client,
    query_url: String,
    action: String,
}

impl IamPolicyClient {
    pub fn new(config: &IamConfig) -> Result<Self, PolicyError> {
        let query_url = format!("{}{}", config.url.trim_end_matches('/'), POLICY_QUERY_PATH);
        reqwest::Url::parse(&query_url).map_err(|e| PolicyError::Client {
            reason: format!("invalid IAM url '{}': {e}", config.url),
        })?;

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| PolicyError::Client {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            query_url,
            action: config.action.clone(),
        })
    }

    async fn send(
        &self,
        uid: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<PolicyDecision, PolicyError> {
        let response = self
            .client
            .get(&self.query_url)
            .query(&[
                ("rid", resource_id),
                ("uid", uid),
                ("action", self.action.as_str()),
            ])
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| classify_error(e, timeout))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(PolicyError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_error(e, timeout))?;
        let parsed: PolicyQueryResponse =
            serde_json::from_slice(&body).map_err(|e| PolicyError::MalformedResponse {
                reason: e.to_string(),
            })?;

        Ok(PolicyDecision {
            allow: parsed.allowed,
        })
    }
}

#[async_trait::async_trait]
impl PolicyClient for IamPolicyClient {
    async fn query(
        &self,
        uid: &str,
        resource_id: &str,
        timeout: Duration,
    ) -> Result<PolicyDecision, PolicyError> {
        let decision = tokio::time::timeout(timeout, self.send(uid, resource_id, timeout))
            .await
            .map_err(|_| PolicyError::Timeout { timeout })??;

        debug!(
            uid = %uid,
            rid = %resource_id,
            allowed = decision.allow,
            "Policy query answered"
        );
        Ok(decision)
    }
}

/// Connect failures, including an expired connect timeout, mean the service
/// is unreachable; any other expiry is a query timeout.
fn classify_error(error: reqwest::Error, timeout: Duration) -> PolicyError {
    if error.is_connect() {
        PolicyError::Unreachable {
            reason: error.to_string(),
        }
    } else if error.is_timeout() {
        PolicyError::Timeout { timeout }
    } else {
        PolicyError::Transport {
            reason: error.to_string(),
        }
    }
}
