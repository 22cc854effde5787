//! Outbound header handling.
//!
//! [`HeaderSanitizer`] is an allow-list: only well-known content negotiation
//! and caching headers (plus configured extras) survive. Credentials and
//! caller-invented headers are dropped. [`CredentialInjector`] then sets the
//! operator-configured Basic credential for legacy upstreams.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use std::collections::{HashMap, HashSet};

use crate::config::{Config, ConfigError, CredentialConfig, SanitizerConfig};

/// Headers that are always forwarded.
const DEFAULT_ALLOWED: &[HeaderName] = &[
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::ACCEPT_LANGUAGE,
    header::CACHE_CONTROL,
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::IF_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_NONE_MATCH,
    header::IF_UNMODIFIED_SINCE,
    header::RANGE,
    header::USER_AGENT,
];

/// Headers that may never be allow-listed.
const CREDENTIAL_HEADERS: &[HeaderName] = &[
    header::AUTHORIZATION,
    header::PROXY_AUTHORIZATION,
    header::COOKIE,
    header::SET_COOKIE,
];

/// Allow-list transform applied before every outbound call.
#[derive(Debug, Clone)]
pub struct HeaderSanitizer {
    allowed: HashSet<HeaderName>,
}

impl Default for HeaderSanitizer {
    fn default() -> Self {
        let mut allowed: HashSet<HeaderName> = DEFAULT_ALLOWED.iter().cloned().collect();
        allowed.insert(HeaderName::from_static("x-request-id"));
        Self { allowed }
    }
}

impl HeaderSanitizer {
    pub fn from_config(config: &SanitizerConfig) -> Result<Self, ConfigError> {
        let mut sanitizer = Self::default();
        for raw in &config.allow_headers {
            let name = HeaderName::from_bytes(raw.trim().as_bytes()).map_err(|_| {
                ConfigError::InvalidHeaderName {
                    header: raw.clone(),
                }
            })?;
            if CREDENTIAL_HEADERS.contains(&name) {
                return Err(ConfigError::CredentialHeaderAllowed {
                    header: raw.clone(),
                });
            }
            sanitizer.allowed.insert(name);
        }
        Ok(sanitizer)
    }

    /// Copy only allow-listed headers.
    pub fn sanitize(&self, headers: &HeaderMap) -> HeaderMap {
        let mut out = HeaderMap::with_capacity(headers.len().min(self.allowed.len()));
        for (name, value) in headers {
            if self.allowed.contains(name) {
                out.append(name.clone(), value.clone());
            }
        }
        out
    }
}

/// Static Basic credentials for legacy upstreams.
#[derive(Debug, Clone, Default)]
pub struct CredentialInjector {
    credentials: HashMap<String, HeaderValue>,
}

impl CredentialInjector {
    /// Collect the credential of every upstream that declares one.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut credentials = HashMap::new();
        for (id, upstream) in &config.upstreams {
            if let Some(credential) = &upstream.credential {
                credentials.insert(id.clone(), basic_header(id, credential)?);
            }
        }
        Ok(Self { credentials })
    }

    /// Overwrite `Authorization` for legacy upstreams; other upstreams get the
    /// headers back untouched.
    pub fn inject(&self, upstream_id: &str, mut headers: HeaderMap) -> HeaderMap {
        if let Some(value) = self.credentials.get(upstream_id) {
            headers.insert(header::AUTHORIZATION, value.clone());
        }
        headers
    }
}

fn basic_header(upstream: &str, credential: &CredentialConfig) -> Result<HeaderValue, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidCredential {
        upstream: upstream.to_string(),
        message: message.to_string(),
    };

    let encoded = match (&credential.basic, &credential.username, &credential.password) {
        (Some(basic), None, None) => {
            let basic = basic.trim();
            if basic.is_empty() {
                return Err(invalid("basic credential is empty"));
            }
            basic.to_string()
        }
        (None, Some(user), Some(password)) => STANDARD.encode(format!("{user}:{password}")),
        (None, Some(_), None) | (None, None, Some(_)) => {
            return Err(invalid("username and password must be set together"));
        }
        (None, None, None) => return Err(invalid("credential has no value")),
        (Some(_), _, _) => {
            return Err(invalid("basic cannot be combined with username/password"));
        }
    };

    let mut value = HeaderValue::from_str(&format!("Basic {encoded}"))
        .map_err(|_| invalid("credential contains characters not allowed in a header"))?;
    value.set_sensitive(true);
    Ok(value)
}
