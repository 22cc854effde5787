//! Bearer credential verification.
//!
//! Tokens are JWTs read from the configured header (`token=<jwt>` or
//! `Bearer <jwt>`), falling back to the auth cookie. Every failure collapses
//! to a 401 for the client; the [`AuthError`] variant stays available for
//! logs.

use http::header::{COOKIE, HeaderMap, HeaderName};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use jsonwebtoken::errors::ErrorKind;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::{AuthConfig, ConfigError, KeyConfig};

/// Why authentication failed. Never shown to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no credential in header or cookie")]
    MissingToken,

    #[error("unsupported authorization scheme")]
    UnsupportedScheme,

    #[error("malformed token")]
    MalformedToken,

    #[error("no verification key for algorithm {algorithm:?}")]
    NoMatchingKey { algorithm: Algorithm },

    #[error("signature verification failed")]
    BadSignature,

    #[error("token expired")]
    Expired,

    #[error("token has no uid claim")]
    MissingUid,

    #[error("uid claim is not a non-empty string")]
    MalformedUid,
}

impl AuthError {
    /// Short machine-readable label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::UnsupportedScheme => "unsupported_scheme",
            AuthError::MalformedToken => "malformed_token",
            AuthError::NoMatchingKey { .. } => "no_matching_key",
            AuthError::BadSignature => "bad_signature",
            AuthError::Expired => "expired",
            AuthError::MissingUid => "missing_uid",
            AuthError::MalformedUid => "malformed_uid",
        }
    }

    /// Higher ranks are reported when several keys reject a token.
    fn rank(&self) -> u8 {
        match self {
            AuthError::NoMatchingKey { .. } => 0,
            AuthError::BadSignature => 1,
            AuthError::MalformedToken
            | AuthError::MissingToken
            | AuthError::UnsupportedScheme => 2,
            AuthError::Expired | AuthError::MissingUid | AuthError::MalformedUid => 3,
        }
    }
}

/// Identity established for one request. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub uid: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    uid: Option<serde_json::Value>,
}

struct VerificationKey {
    id: Option<String>,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Verifies bearer tokens against the configured key set.
#[derive(Debug)]
pub struct Authenticator {
    header: HeaderName,
    cookie: Option<String>,
    keys: Vec<VerificationKey>,
    leeway: Duration,
}

impl Authenticator {
    /// Load the key set. Unreadable or unparseable key material is a
    /// configuration error.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let header = HeaderName::from_bytes(config.header.to_ascii_lowercase().as_bytes())
            .map_err(|_| ConfigError::InvalidHeaderName {
                header: config.header.clone(),
            })?;

        let keys = config
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| load_key(index, key))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            header,
            cookie: config.cookie.clone().filter(|c| !c.is_empty()),
            keys,
            leeway: config.leeway,
        })
    }

    /// Authenticate a request from its headers.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, AuthError> {
        let token = self.extract_token(headers)?;
        self.verify(token)
    }

    /// Verify a raw JWT and extract the caller's uid.
    pub fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::MalformedToken)?;

        let mut best: Option<AuthError> = None;
        for key in self.candidates(header.alg, header.kid.as_deref()) {
            match self.verify_with(token, key) {
                Ok(ctx) => return Ok(ctx),
                Err(e) => {
                    if best.as_ref().is_none_or(|b| e.rank() > b.rank()) {
                        best = Some(e);
                    }
                }
            }
        }

        Err(best.unwrap_or(AuthError::NoMatchingKey {
            algorithm: header.alg,
        }))
    }

    fn candidates<'a>(
        &'a self,
        algorithm: Algorithm,
        kid: Option<&'a str>,
    ) -> impl Iterator<Item = &'a VerificationKey> {
        self.keys.iter().filter(move |k| {
            k.algorithm == algorithm
                && match (k.id.as_deref(), kid) {
                    (Some(id), Some(kid)) => id == kid,
                    _ => true,
                }
        })
    }

    fn verify_with(&self, token: &str, key: &VerificationKey) -> Result<AuthContext, AuthError> {
        let mut validation = Validation::new(key.algorithm);
        validation.validate_aud = false;
        validation.leeway = self.leeway.as_secs();

        let data = decode::<Claims>(token, &key.key, &validation).map_err(|e| match e.kind() {
            ErrorKind::InvalidSignature => AuthError::BadSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidKeyFormat => AuthError::NoMatchingKey {
                algorithm: key.algorithm,
            },
            _ => AuthError::MalformedToken,
        })?;

        match data.claims.uid {
            None | Some(serde_json::Value::Null) => Err(AuthError::MissingUid),
            Some(serde_json::Value::String(uid)) if !uid.is_empty() => Ok(AuthContext { uid }),
            Some(_) => Err(AuthError::MalformedUid),
        }
    }

    fn extract_token<'h>(&self, headers: &'h HeaderMap) -> Result<&'h str, AuthError> {
        if let Some(value) = headers.get(&self.header) {
            let value = value.to_str().map_err(|_| AuthError::MalformedToken)?.trim();
            let token = strip_scheme(value, "token=")
                .or_else(|| strip_scheme(value, "bearer "))
                .ok_or(AuthError::UnsupportedScheme)?
                .trim();
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            return Ok(token);
        }

        let Some(cookie_name) = &self.cookie else {
            return Err(AuthError::MissingToken);
        };
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == cookie_name.as_str())
            .map(|(_, value)| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::MissingToken)
    }
}

/// Case-insensitive scheme prefix removal.
fn strip_scheme<'a>(value: &'a str, scheme: &str) -> Option<&'a str> {
    let head = value.get(..scheme.len())?;
    head.eq_ignore_ascii_case(scheme)
        .then(|| &value[scheme.len()..])
}

fn load_key(index: usize, key: &KeyConfig) -> Result<VerificationKey, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidKey { index, message };

    let pem = || -> Result<Vec<u8>, ConfigError> {
        match (&key.public_key, &key.public_key_file) {
            (Some(pem), None) => Ok(pem.as_bytes().to_vec()),
            (None, Some(path)) => std::fs::read(path)
                .map_err(|e| invalid(format!("cannot read '{}': {e}", path.display()))),
            (Some(_), Some(_)) => Err(invalid(
                "public_key and public_key_file are mutually exclusive".to_string(),
            )),
            (None, None) => Err(invalid(format!(
                "{:?} requires public_key or public_key_file",
                key.algorithm
            ))),
        }
    };

    let decoding = match key.algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            let secret = key
                .secret
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid(format!("{:?} requires secret", key.algorithm)))?;
            DecodingKey::from_secret(secret.as_bytes())
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => {
            DecodingKey::from_rsa_pem(&pem()?).map_err(|e| invalid(e.to_string()))?
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            DecodingKey::from_ec_pem(&pem()?).map_err(|e| invalid(e.to_string()))?
        }
        Algorithm::EdDSA => DecodingKey::from_ed_pem(&pem()?).map_err(|e| invalid(e.to_string()))?,
    };

    Ok(VerificationKey {
        id: key.id.clone(),
        algorithm: key.algorithm,
        key: decoding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    const SECRET: &str = "authgate-test-secret";

    fn key(id: Option<&str>, secret: &str) -> KeyConfig {
        KeyConfig {
            id: id.map(str::to_string),
            algorithm: Algorithm::HS256,
            secret: Some(secret.to_string()),
            public_key: None,
            public_key_file: None,
        }
    }

    fn authenticator(keys: Vec<KeyConfig>) -> Authenticator {
        Authenticator::from_config(&AuthConfig {
            keys,
            ..Default::default()
        })
        .unwrap()
    }

    fn exp_in(secs: i64) -> i64 {
        chrono::Utc::now().timestamp() + secs
    }

    fn mint(claims: serde_json::Value, secret: &str, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_string);
        encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
        headers
    }

    #[test]
    fn test_valid_token_schemes() {
        let auth = authenticator(vec![key(None, SECRET)]);
        let token = mint(json!({"uid": "bozydar", "exp": exp_in(300)}), SECRET, None);

        for value in [format!("token={token}"), format!("Bearer {token}")] {
            let ctx = auth.authenticate(&headers("authorization", &value)).unwrap();
            assert_eq!(ctx.uid, "bozydar");
        }
    }

    #[test]
    fn test_cookie_fallback() {
        let auth = authenticator(vec![key(None, SECRET)]);
        let token = mint(json!({"uid": "alice", "exp": exp_in(300)}), SECRET, None);
        let cookie = format!("theme=dark; dcos-acs-auth-cookie={token}");

        let ctx = auth.authenticate(&headers("cookie", &cookie)).unwrap();
        assert_eq!(ctx.uid, "alice");
    }

    #[test]
    fn test_missing_token() {
        let auth = authenticator(vec![key(None, SECRET)]);
        assert_eq!(
            auth.authenticate(&HeaderMap::new()),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            auth.authenticate(&headers("cookie", "theme=dark")),
            Err(AuthError::MissingToken)
        );
        assert_eq!(
            auth.authenticate(&headers("authorization", "token=")),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn test_unsupported_scheme() {
        let auth = authenticator(vec![key(None, SECRET)]);
        assert_eq!(
            auth.authenticate(&headers("authorization", "Basic dXNlcjpwYXNz")),
            Err(AuthError::UnsupportedScheme)
        );
    }

    #[test]
    fn test_bad_signature() {
        let auth = authenticator(vec![key(None, SECRET)]);
        let token = mint(json!({"uid": "mallory", "exp": exp_in(300)}), "other", None);
        assert_eq!(auth.verify(&token), Err(AuthError::BadSignature));
    }

    #[test]
    fn test_expired_token() {
        let auth = authenticator(vec![key(None, SECRET)]);
        let token = mint(json!({"uid": "bozydar", "exp": exp_in(-3600)}), SECRET, None);
        assert_eq!(auth.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_leeway_accepts_recently_expired() {
        let auth = Authenticator::from_config(&AuthConfig {
            keys: vec![key(None, SECRET)],
            leeway: Duration::from_secs(120),
            ..Default::default()
        })
        .unwrap();
        let token = mint(json!({"uid": "bozydar", "exp": exp_in(-30)}), SECRET, None);
        assert!(auth.verify(&token).is_ok());
    }

    #[test]
    fn test_uid_claim_checks() {
        let auth = authenticator(vec![key(None, SECRET)]);
        let token = mint(json!({"sub": "bozydar", "exp": exp_in(300)}), SECRET, None);
        assert_eq!(auth.verify(&token), Err(AuthError::MissingUid));

        let token = mint(json!({"uid": 42, "exp": exp_in(300)}), SECRET, None);
        assert_eq!(auth.verify(&token), Err(AuthError::MalformedUid));

        let token = mint(json!({"uid": "", "exp": exp_in(300)}), SECRET, None);
        assert_eq!(auth.verify(&token), Err(AuthError::MalformedUid));
    }

    #[test]
    fn test_malformed_token() {
        let auth = authenticator(vec![key(None, SECRET)]);
        assert_eq!(auth.verify("not.a.jwt"), Err(AuthError::MalformedToken));
        assert_eq!(auth.verify("garbage"), Err(AuthError::MalformedToken));
    }

    #[test]
    fn test_key_id_selection() {
        let auth = authenticator(vec![key(Some("old"), "old-secret"), key(Some("new"), SECRET)]);
        let token = mint(json!({"uid": "bozydar", "exp": exp_in(300)}), SECRET, Some("new"));
        assert!(auth.verify(&token).is_ok());

        let token = mint(json!({"uid": "bozydar", "exp": exp_in(300)}), SECRET, Some("gone"));
        assert!(matches!(
            auth.verify(&token),
            Err(AuthError::NoMatchingKey { .. })
        ));
    }

    #[test]
    fn test_expired_beats_bad_signature() {
        let auth = authenticator(vec![key(None, "wrong"), key(None, SECRET)]);
        let token = mint(json!({"uid": "bozydar", "exp": exp_in(-3600)}), SECRET, None);
        assert_eq!(auth.verify(&token), Err(AuthError::Expired));
    }

    #[test]
    fn test_key_loading_errors() {
        let mut missing_secret = key(None, "");
        missing_secret.secret = None;
        assert!(matches!(
            Authenticator::from_config(&AuthConfig {
                keys: vec![key(None, SECRET), missing_secret],
                ..Default::default()
            }),
            Err(ConfigError::InvalidKey { index: 1, .. })
        ));

        let rsa = KeyConfig {
            id: None,
            algorithm: Algorithm::RS256,
            secret: None,
            public_key: Some("not a pem".to_string()),
            public_key_file: None,
        };
        assert!(matches!(
            Authenticator::from_config(&AuthConfig {
                keys: vec![rsa],
                ..Default::default()
            }),
            Err(ConfigError::InvalidKey { index: 0, .. })
        ));
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        let kinds = [
            AuthError::MissingToken.kind(),
            AuthError::UnsupportedScheme.kind(),
            AuthError::MalformedToken.kind(),
            AuthError::BadSignature.kind(),
            AuthError::Expired.kind(),
            AuthError::MissingUid.kind(),
            AuthError::MalformedUid.kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
