//! Per-request decision state machine.
//!
//! ```text
//! START -> BAD_PATH (400)
//!       -> ROUTED -> FORWARD                                  (open)
//!                 -> AUTHENTICATING -> AUTH_FAIL (401)
//!                                   -> AUTH_OK -> FORWARD      (authenticated)
//!                                              -> SELF_CHECK   (self_permission)
//!                                              -> POLICY_QUERY (acl)
//! SELF_CHECK   -> FORWARD (own uid) | POLICY_QUERY (others resource)
//! POLICY_QUERY -> FORWARD (allow)   | POLICY_DENY (403)
//! ```
//!
//! Routing runs on the canonical path, and the canonical path is what gets
//! forwarded, so dot segments and encoded dots cannot steer a request past
//! the rule that governs its real target.
//!
//! Each terminal state carries the audit event it must emit, and
//! [`RequestGate::decide`] records it exactly once before returning.

use chrono::Utc;
use http::HeaderMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditLogger, AuditReason, AuditResult};
use crate::auth::{AuthContext, Authenticator};
use crate::config::{Config, ConfigError};
use crate::error::GateError;
use crate::headers::{CredentialInjector, HeaderSanitizer};
use crate::policy::PolicyClient;
use crate::routes::{Check, RouteMatch, RouteTable, UpstreamTarget, canonicalize_path};

/// What the gate needs to know about an inbound request.
#[derive(Debug, Clone)]
pub struct GateRequest {
    /// Request path as received; canonicalized before matching.
    pub path: String,
    /// Path and query as received, written to the audit record.
    pub request_uri: String,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
}

/// Where and with which headers to forward an admitted request.
#[derive(Debug, Clone)]
pub struct ForwardPlan {
    pub upstream: Arc<UpstreamTarget>,
    /// Canonical path the decision was made on.
    pub path: String,
    /// Sanitized headers, with the legacy credential injected when the
    /// upstream has one.
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub enum Verdict {
    Forward(ForwardPlan),
    Reject(GateError),
}

enum State {
    Start,
    Routed(RouteMatch),
    Authenticating {
        upstream: Arc<UpstreamTarget>,
        resource_id: String,
        check: Check,
    },
    AuthOk {
        upstream: Arc<UpstreamTarget>,
        resource_id: String,
        check: Check,
        ctx: AuthContext,
    },
    SelfCheck {
        upstream: Arc<UpstreamTarget>,
        resource_id: String,
        path_uid: Option<String>,
        others_resource: String,
        ctx: AuthContext,
    },
    PolicyQuery {
        upstream: Arc<UpstreamTarget>,
        resource_id: String,
        ctx: AuthContext,
    },
    Done(Terminal),
}

enum Terminal {
    Forward {
        upstream: Arc<UpstreamTarget>,
        audit: Option<AuditEvent>,
    },
    AuthFail {
        audit: AuditEvent,
    },
    PolicyDeny {
        audit: AuditEvent,
    },
    NotFound,
    BadPath,
}

/// Orchestrates routing, authentication, policy and audit for each request.
///
/// All fields are immutable after construction; one gate is shared by every
/// connection.
pub struct RequestGate {
    routes: Arc<RouteTable>,
    authenticator: Authenticator,
    policy: Arc<dyn PolicyClient>,
    policy_timeout: Duration,
    action: String,
    audit: AuditLogger,
    sanitizer: HeaderSanitizer,
    injector: CredentialInjector,
    challenge: String,
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("routes", &self.routes.rule_count())
            .field("policy_timeout", &self.policy_timeout)
            .field("action", &self.action)
            .finish_non_exhaustive()
    }
}

impl RequestGate {
    /// Build every component from a validated configuration.
    pub fn from_config(
        config: &Config,
        policy: Arc<dyn PolicyClient>,
        audit: AuditLogger,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            routes: Arc::new(RouteTable::from_config(config)?),
            authenticator: Authenticator::from_config(&config.auth)?,
            policy,
            policy_timeout: config.iam.timeout,
            action: config.iam.action.clone(),
            audit,
            sanitizer: HeaderSanitizer::from_config(&config.sanitizer)?,
            injector: CredentialInjector::from_config(config)?,
            challenge: config.auth.challenge.clone(),
        })
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Run the state machine to a terminal state.
    pub async fn decide(&self, request: &GateRequest) -> Verdict {
        let mut path = String::new();
        let mut state = State::Start;
        loop {
            state = match state {
                State::Start => match canonicalize_path(&request.path) {
                    Err(e) => {
                        warn!(path = %request.path, error = %e, "Refusing non-canonical path");
                        State::Done(Terminal::BadPath)
                    }
                    Ok(canonical) => {
                        path = canonical;
                        match self.routes.match_path(&path) {
                            Some(route) => State::Routed(route),
                            None => match self.routes.unmatched_upstream() {
                                Some(upstream) => State::Done(Terminal::Forward {
                                    upstream: Arc::clone(upstream),
                                    audit: None,
                                }),
                                None => State::Done(Terminal::NotFound),
                            },
                        }
                    }
                },

                State::Routed(route) => {
                    debug!(
                        path = %path,
                        route = %route.rule.pattern,
                        access = route.rule.classification.name(),
                        "Route matched"
                    );
                    let upstream = Arc::clone(&route.rule.upstream);
                    match route.guard {
                        None => State::Done(Terminal::Forward {
                            upstream,
                            audit: None,
                        }),
                        Some(guard) => State::Authenticating {
                            upstream,
                            resource_id: guard.resource_id,
                            check: guard.check,
                        },
                    }
                }

                State::Authenticating {
                    upstream,
                    resource_id,
                    check,
                } => match self.authenticator.authenticate(&request.headers) {
                    Ok(ctx) => {
                        self.audit.identity_verified(&ctx.uid);
                        State::AuthOk {
                            upstream,
                            resource_id,
                            check,
                            ctx,
                        }
                    }
                    Err(e) => {
                        warn!(path = %path, reason = e.kind(), "Authentication failed");
                        State::Done(Terminal::AuthFail {
                            audit: self.event(
                                request,
                                resource_id,
                                AuditResult::Deny,
                                AuditReason::NotAuthenticated,
                                None,
                            ),
                        })
                    }
                },

                State::AuthOk {
                    upstream,
                    resource_id,
                    check,
                    ctx,
                } => match check {
                    Check::AuthenticatedOnly => State::Done(Terminal::Forward {
                        upstream,
                        audit: Some(self.event(
                            request,
                            resource_id,
                            AuditResult::Allow,
                            AuditReason::AuthenticatedOnly,
                            Some(ctx.uid),
                        )),
                    }),
                    Check::OwnResource {
                        path_uid,
                        others_resource,
                    } => State::SelfCheck {
                        upstream,
                        resource_id,
                        path_uid,
                        others_resource,
                        ctx,
                    },
                    Check::Policy => State::PolicyQuery {
                        upstream,
                        resource_id,
                        ctx,
                    },
                },

                State::SelfCheck {
                    upstream,
                    resource_id,
                    path_uid,
                    others_resource,
                    ctx,
                } => {
                    if path_uid.as_deref() == Some(ctx.uid.as_str()) {
                        State::Done(Terminal::Forward {
                            upstream,
                            audit: Some(self.event(
                                request,
                                resource_id,
                                AuditResult::Allow,
                                AuditReason::OwnPermissions,
                                Some(ctx.uid),
                            )),
                        })
                    } else {
                        State::PolicyQuery {
                            upstream,
                            resource_id: others_resource,
                            ctx,
                        }
                    }
                }

                State::PolicyQuery {
                    upstream,
                    resource_id,
                    ctx,
                } => {
                    let allow = match self
                        .policy
                        .query(&ctx.uid, &resource_id, self.policy_timeout)
                        .await
                    {
                        Ok(decision) => decision.allow,
                        Err(e) => {
                            warn!(
                                uid = %ctx.uid,
                                rid = %resource_id,
                                error = %e,
                                reason = e.kind(),
                                "Policy query failed, denying"
                            );
                            false
                        }
                    };

                    let result = if allow {
                        AuditResult::Allow
                    } else {
                        AuditResult::Deny
                    };
                    let audit = self.event(
                        request,
                        resource_id,
                        result,
                        AuditReason::PolicyResponse,
                        Some(ctx.uid),
                    );
                    if allow {
                        State::Done(Terminal::Forward {
                            upstream,
                            audit: Some(audit),
                        })
                    } else {
                        State::Done(Terminal::PolicyDeny { audit })
                    }
                }

                State::Done(terminal) => return self.finish(terminal, path, &request.headers),
            };
        }
    }

    fn finish(&self, terminal: Terminal, path: String, headers: &HeaderMap) -> Verdict {
        match terminal {
            Terminal::Forward { upstream, audit } => {
                if let Some(event) = audit {
                    self.audit.record(&event);
                }
                let headers = self.sanitizer.sanitize(headers);
                let headers = self.injector.inject(&upstream.id, headers);
                Verdict::Forward(ForwardPlan {
                    upstream,
                    path,
                    headers,
                })
            }
            Terminal::AuthFail { audit } => {
                self.audit.record(&audit);
                Verdict::Reject(GateError::Unauthenticated {
                    challenge: self.challenge.clone(),
                })
            }
            Terminal::PolicyDeny { audit } => {
                self.audit.record(&audit);
                Verdict::Reject(GateError::PolicyDenied)
            }
            Terminal::NotFound => Verdict::Reject(GateError::RouteNotFound),
            Terminal::BadPath => Verdict::Reject(GateError::MalformedPath),
        }
    }

    fn event(
        &self,
        request: &GateRequest,
        object: String,
        result: AuditResult,
        reason: AuditReason,
        uid: Option<String>,
    ) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            object,
            action: self.action.clone(),
            result,
            reason,
            client_ip: request.client_ip,
            request_uri: request.request_uri.clone(),
            uid,
        }
    }
}
