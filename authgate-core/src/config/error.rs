//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::routes::RouteError;

/// Configuration loading and validation errors.
///
/// Any of these aborts startup: the gate never runs with a partially valid
/// route table or key set.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Structural validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Schema version not supported.
    #[error("unsupported schema version {version}, expected 1")]
    UnsupportedSchemaVersion { version: u32 },

    /// No routes defined in configuration.
    #[error("no routes defined in configuration")]
    NoRoutesDefined,

    /// Two routes share the same path pattern.
    #[error("duplicate route pattern: '{path}'")]
    DuplicateRoute { path: String },

    /// Route pattern, resource template or upstream reference is invalid.
    #[error("invalid route: {0}")]
    InvalidRoute(#[from] RouteError),

    /// Unmatched-path passthrough refers to an upstream that does not exist.
    #[error("undefined upstream '{upstream}' for unmatched paths")]
    UndefinedPassthroughUpstream { upstream: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Value validation errors
    // ─────────────────────────────────────────────────────────────────────────
    /// Invalid URL format.
    #[error("invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    /// Routes require authentication but no verification keys are configured.
    #[error("routes require authentication but auth.keys is empty")]
    NoVerificationKeys,

    /// A verification key could not be loaded.
    #[error("invalid verification key #{index}: {message}")]
    InvalidKey { index: usize, message: String },

    /// A header name in the configuration is not a valid HTTP header name.
    #[error("invalid header name '{header}'")]
    InvalidHeaderName { header: String },

    /// The sanitizer allow-list names a credential-bearing header.
    #[error("header '{header}' carries credentials and cannot be forwarded")]
    CredentialHeaderAllowed { header: String },

    /// Injected upstream credential is incomplete or not encodable.
    #[error("invalid credential for upstream '{upstream}': {message}")]
    InvalidCredential { upstream: String, message: String },

    /// Required environment variable not set.
    #[error("environment variable '{var}' not set (required for field '{field}')")]
    MissingEnvVar { var: String, field: String },

    // ─────────────────────────────────────────────────────────────────────────
    // I/O and parsing errors
    // ─────────────────────────────────────────────────────────────────────────
    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Config file not found at any search location.
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    /// Empty configuration file.
    #[error("configuration file is empty")]
    EmptyConfigFile,
}

/// Validation warnings (non-fatal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// An upstream is defined but no route or passthrough refers to it.
    UnusedUpstream { upstream: String },

    /// An upstream has a credential configured but no route forwards to it.
    UnusedCredential { upstream: String },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::UnusedUpstream { upstream } => {
                write!(f, "upstream '{}' is not referenced by any route", upstream)
            }
            ValidationWarning::UnusedCredential { upstream } => {
                write!(
                    f,
                    "credential for upstream '{}' is never injected (no route forwards to it)",
                    upstream
                )
            }
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal findings, logged at startup.
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    /// Returns `true` if validation produced no warnings.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}
