//! Configuration schema type definitions.
//!
//! # Example
//! ```yaml
//! schema: 1
//!
//! auth:
//!   keys:
//!     - algorithm: RS256
//!       public_key_file: /run/authgate/iam-public.pem
//!
//! iam:
//!   url: http://127.0.0.1:8101
//!   timeout: 5s
//!
//! upstreams:
//!   iam:
//!     url: http://127.0.0.1:8101
//!   exhibitor:
//!     url: http://127.0.0.1:8181
//!     strip_prefix: /exhibitor
//!     credential:
//!       basic: ${EXHIBITOR_ADMIN_HTTPBASICAUTH_CREDS}
//!
//! routes:
//!   - path: /exhibitor/*
//!     access: acl
//!     resource: dcos:adminrouter:ops:exhibitor
//!     upstream: exhibitor
//!   - path: /acs/api/v1/users/{uid}/permissions
//!     access: self_permission
//!     resource: dcos:iam:users:{uid}:permissions
//!     uid_capture: uid
//!     others_resource: dcos:adminrouter:acs
//!     upstream: iam
//! ```

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::duration_format;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-Level Schema
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Root configuration structure.
///
/// Loaded once at startup. Everything derived from it (route table, key set,
/// injected credentials) is immutable for the lifetime of the process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Schema version (must be 1).
    pub schema: u32,

    /// Bearer credential verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Policy decision service.
    pub iam: IamConfig,

    /// Outbound header allow-list.
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    /// Upstream services, keyed by id.
    pub upstreams: BTreeMap<String, UpstreamConfig>,

    /// Route table, in declaration order.
    pub routes: Vec<RouteConfig>,

    /// Upstream that receives paths no route matches, as if the route were
    /// `open`. When absent, unmatched paths get 404.
    #[serde(default)]
    pub unmatched_upstream: Option<String>,
}

impl Config {
    /// Returns `true` if any route needs a verified identity.
    pub fn requires_authentication(&self) -> bool {
        self.routes.iter().any(|r| r.access != Access::Open)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Authentication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where bearer tokens are read from and how they are verified.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Header carrying `token=<jwt>` or `Bearer <jwt>`.
    #[serde(default = "default_auth_header")]
    pub header: String,

    /// Cookie consulted when the header is absent.
    #[serde(default = "default_auth_cookie")]
    pub cookie: Option<String>,

    /// Clock skew tolerated when checking `exp`.
    #[serde(default, deserialize_with = "duration_format::deserialize")]
    pub leeway: Duration,

    /// `WWW-Authenticate` challenge sent with 401 responses.
    #[serde(default = "default_challenge")]
    pub challenge: String,

    /// Verification key set. Provisioned externally.
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            cookie: default_auth_cookie(),
            leeway: Duration::ZERO,
            challenge: default_challenge(),
            keys: Vec::new(),
        }
    }
}

fn default_auth_header() -> String {
    "authorization".to_string()
}

fn default_auth_cookie() -> Option<String> {
    Some("dcos-acs-auth-cookie".to_string())
}

fn default_challenge() -> String {
    "acsjwt".to_string()
}

/// A single token verification key.
///
/// HMAC algorithms take `secret`; RSA, EC and EdDSA algorithms take a PEM
/// public key, inline or from a file.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyConfig {
    /// Optional key id, matched against the token's `kid` header.
    #[serde(default)]
    pub id: Option<String>,

    /// Signature algorithm (`HS256`, `RS256`, `ES256`, ...).
    pub algorithm: Algorithm,

    /// Shared secret for HMAC algorithms.
    #[serde(default)]
    pub secret: Option<String>,

    /// Inline PEM public key.
    #[serde(default)]
    pub public_key: Option<String>,

    /// Path to a PEM public key.
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
}

impl fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfig")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("public_key", &self.public_key.as_ref().map(|_| "<pem>"))
            .field("public_key_file", &self.public_key_file)
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Policy Service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Connection settings for the IAM policy query endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IamConfig {
    /// Base URL of the IAM service.
    pub url: String,

    /// Per-query deadline; expiry is a deny.
    #[serde(
        default = "default_policy_timeout",
        deserialize_with = "duration_format::deserialize"
    )]
    pub timeout: Duration,

    /// TCP connect timeout for the policy client.
    #[serde(
        default = "default_connect_timeout",
        deserialize_with = "duration_format::deserialize"
    )]
    pub connect_timeout: Duration,

    /// Action sent with every policy query and written to audit records.
    #[serde(default = "default_action")]
    pub action: String,
}

fn default_policy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_action() -> String {
    "full".to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Header Handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Extra headers forwarded on top of the built-in allow-list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SanitizerConfig {
    /// Header names (case-insensitive). Credential headers are rejected.
    #[serde(default)]
    pub allow_headers: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstreams
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An internal service requests are forwarded to.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base URL (`http://host:port`).
    pub url: String,

    /// Leading path prefix removed before forwarding.
    #[serde(default)]
    pub strip_prefix: Option<String>,

    /// Static credential injected into every forwarded request.
    #[serde(default)]
    pub credential: Option<CredentialConfig>,
}

/// Operator-configured Basic credential for a legacy upstream.
///
/// Either `basic` (already base64-encoded `user:password`) or a
/// `username`/`password` pair.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    #[serde(default)]
    pub basic: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("basic", &self.basic.as_ref().map(|_| "[REDACTED]"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Routes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Access classification as written in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// No authentication, no audit.
    Open,
    /// Any verified identity may pass.
    Authenticated,
    /// Caller may read its own resource; others go through a policy query.
    SelfPermission,
    /// Every request needs a policy allow.
    Acl,
}

/// One entry of the route table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Path pattern: literal segments, `{capture}` segments, optional
    /// trailing `*` for prefix matching.
    pub path: String,

    /// Access classification.
    pub access: Access,

    /// Resource id template, may reference captures (`{serviceName}`).
    /// Required unless `access: open`.
    #[serde(default)]
    pub resource: Option<String>,

    /// Upstream id from `upstreams`.
    pub upstream: String,

    /// Capture holding the uid for `self_permission` routes.
    #[serde(default)]
    pub uid_capture: Option<String>,

    /// Fixed resource id checked when the uid in the path is not the caller's.
    #[serde(default)]
    pub others_resource: Option<String>,
}
