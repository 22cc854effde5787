//! Client-visible rejection taxonomy.

use http::StatusCode;
use thiserror::Error;

/// Why the gate refused to forward a request.
///
/// Internal detail (which auth check failed, why the policy service gave no
/// answer) is logged where it happens and never carried here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// No valid credential.
    #[error("authentication required")]
    Unauthenticated {
        /// `WWW-Authenticate` challenge for the response.
        challenge: String,
    },

    /// Explicit deny or fail-closed policy error.
    #[error("access denied")]
    PolicyDenied,

    /// No route matches and no passthrough upstream is configured.
    #[error("not found")]
    RouteNotFound,

    /// Path has no safe canonical form (climbs above `/`, encodes a
    /// separator, or is badly escaped).
    #[error("malformed request path")]
    MalformedPath,
}

impl GateError {
    pub fn status(&self) -> StatusCode {
        match self {
            GateError::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            GateError::PolicyDenied => StatusCode::FORBIDDEN,
            GateError::RouteNotFound => StatusCode::NOT_FOUND,
            GateError::MalformedPath => StatusCode::BAD_REQUEST,
        }
    }

    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::Unauthenticated { .. } => "unauthenticated",
            GateError::PolicyDenied => "policy_denied",
            GateError::RouteNotFound => "route_not_found",
            GateError::MalformedPath => "malformed_path",
        }
    }
}
