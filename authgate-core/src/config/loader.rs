//! Configuration loading and validation.
//!
//! Loading flow: locate file, read, substitute `${VAR}` references, parse
//! YAML, validate. Every component derived from the config (route table, key
//! set, sanitizer, injector) is built once during validation so that a bad
//! pattern or unreadable key aborts startup instead of surfacing per request.

use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::Config;
use crate::auth::Authenticator;
use crate::headers::{CredentialInjector, HeaderSanitizer};
use crate::routes::RouteTable;

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("AUTHGATE_CONFIG") {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("/etc/authgate/config.yaml"));
    paths.push(PathBuf::from("./config.yaml"));

    paths
}

/// Find the first existing config file from the search paths.
///
/// An explicit path (CLI flag) is authoritative: if it does not exist the
/// search stops there.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    let paths = default_config_paths();
    for path in &paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    Err(ConfigError::ConfigFileNotFound { searched: paths })
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse configuration from YAML text, with env substitution.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(contents)?;
    let config: Config = serde_yaml::from_str(&contents)?;

    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a literal pattern, covered by
// test_env_var_pattern_compiles().
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("ENV_VAR_PATTERN is a valid literal regex")
});

/// Substitute environment variables in a string.
///
/// # Syntax
/// - `${VAR}` - Required, fail if not set
/// - `${VAR:-default}` - Optional with default
///
/// Substitution is single-pass: values containing `${...}` are not expanded
/// again.
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = cap.get(1).map_or("", |m| m.as_str());
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a parsed configuration.
///
/// Fatal problems return `Err`; findings that leave a working gate are
/// returned as warnings.
pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    if config.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: config.schema,
        });
    }

    if config.routes.is_empty() {
        return Err(ConfigError::NoRoutesDefined);
    }

    let mut seen_paths = HashSet::new();
    for route in &config.routes {
        if !seen_paths.insert(route.path.as_str()) {
            return Err(ConfigError::DuplicateRoute {
                path: route.path.clone(),
            });
        }
    }

    validate_http_url(&config.iam.url)?;
    for upstream in config.upstreams.values() {
        validate_http_url(&upstream.url)?;
    }

    if let Some(upstream) = &config.unmatched_upstream
        && !config.upstreams.contains_key(upstream)
    {
        return Err(ConfigError::UndefinedPassthroughUpstream {
            upstream: upstream.clone(),
        });
    }

    if config.requires_authentication() && config.auth.keys.is_empty() {
        return Err(ConfigError::NoVerificationKeys);
    }

    // Build every derived component once; their constructors carry the
    // detailed checks.
    RouteTable::from_config(config)?;
    HeaderSanitizer::from_config(&config.sanitizer)?;
    CredentialInjector::from_config(config)?;
    if !config.auth.keys.is_empty() {
        Authenticator::from_config(&config.auth)?;
    }

    let referenced: HashSet<&str> = config
        .routes
        .iter()
        .map(|r| r.upstream.as_str())
        .chain(config.unmatched_upstream.as_deref())
        .collect();
    for (id, upstream) in &config.upstreams {
        if referenced.contains(id.as_str()) {
            continue;
        }
        warnings.push(ValidationWarning::UnusedUpstream {
            upstream: id.clone(),
        });
        if upstream.credential.is_some() {
            warnings.push(ValidationWarning::UnusedCredential {
                upstream: id.clone(),
            });
        }
    }

    Ok(ValidationResult { warnings })
}

fn validate_http_url(url: &str) -> Result<(), ConfigError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| ConfigError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            message: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            message: "missing host".to_string(),
        });
    }
    if parsed.query().is_some() {
        return Err(ConfigError::InvalidUrl {
            url: url.to_string(),
            message: "query strings are not allowed in base URLs".to_string(),
        });
    }

    Ok(())
}
