//! Route table: path patterns, access classification and resource ids.
//!
//! The table is built once from configuration and shared by `Arc`. Each
//! request resolves to at most one rule; when several patterns match, the most
//! specific one wins:
//!
//! 1. more literal characters
//! 2. exact pattern over trailing-`*` prefix pattern
//! 3. fewer `{capture}` segments
//! 4. earlier declaration
//!
//! The matched rule's resource template is rendered exactly once, with the
//! request's own captures, and the result travels with the [`RouteMatch`].

use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::config::{Access, Config, RouteConfig, UpstreamConfig};

/// Errors building the route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid resource template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("resource template for '{pattern}' uses '{{{placeholder}}}', which the path does not capture")]
    UnboundPlaceholder { pattern: String, placeholder: String },

    #[error("route '{pattern}' requires a resource id")]
    MissingResource { pattern: String },

    #[error("self_permission route '{pattern}' requires uid_capture")]
    MissingUidCapture { pattern: String },

    #[error("uid_capture '{capture}' is not a capture of '{pattern}'")]
    UnknownUidCapture { pattern: String, capture: String },

    #[error("self_permission route '{pattern}' requires others_resource")]
    MissingOthersResource { pattern: String },

    #[error("others_resource '{resource}' of '{pattern}' must not contain placeholders")]
    TemplatedOthersResource { pattern: String, resource: String },

    #[error("route '{pattern}' refers to undefined upstream '{upstream}'")]
    UndefinedUpstream { pattern: String, upstream: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Path patterns
// ─────────────────────────────────────────────────────────────────────────────

/// A compiled path pattern.
///
/// Literal text matches itself, `{name}` matches one non-empty path segment
/// and records it under `name`, and a trailing `*` turns the pattern into a
/// prefix match.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    regex: Regex,
    captures: Vec<String>,
    literal_len: usize,
    prefix: bool,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if !pattern.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let (body, prefix) = match pattern.strip_suffix('*') {
            Some(body) => (body, true),
            None => (pattern, false),
        };
        if body.contains('*') {
            return Err(invalid("'*' is only allowed at the end"));
        }

        let mut regex_src = String::from("^");
        let mut captures = Vec::new();
        let mut literal_len = 0;
        let mut rest = body;

        while let Some(open) = rest.find('{') {
            let literal = &rest[..open];
            if literal.contains('}') {
                return Err(invalid("unbalanced '}'"));
            }
            regex_src.push_str(&regex::escape(literal));
            literal_len += literal.len();

            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
            let name = &after[..close];
            if !is_identifier(name) {
                return Err(invalid(&format!("invalid capture name '{name}'")));
            }
            if captures.iter().any(|c| c == name) {
                return Err(invalid(&format!("duplicate capture '{name}'")));
            }
            regex_src.push_str(&format!("(?P<{name}>[^/]+)"));
            captures.push(name.to_string());
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(invalid("unbalanced '}'"));
        }
        regex_src.push_str(&regex::escape(rest));
        literal_len += rest.len();
        if !prefix {
            regex_src.push('$');
        }

        let regex = Regex::new(&regex_src).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
            captures,
            literal_len,
            prefix,
        })
    }

    /// The pattern as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Capture names, in path order.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// Match a request path, returning the captured segments.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.captures
                .iter()
                .filter_map(|name| {
                    caps.name(name)
                        .map(|m| (name.clone(), m.as_str().to_string()))
                })
                .collect(),
        )
    }

    /// Sort key; lower sorts first and wins.
    fn specificity(&self) -> (std::cmp::Reverse<usize>, bool, usize) {
        (
            std::cmp::Reverse(self.literal_len),
            self.prefix,
            self.captures.len(),
        )
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ─────────────────────────────────────────────────────────────────────────────
// Request path canonicalization
// ─────────────────────────────────────────────────────────────────────────────

/// Request paths that cannot be matched safely.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is not absolute")]
    NotAbsolute,

    #[error("malformed percent-encoding")]
    BadEncoding,

    #[error("encoded separator or control character")]
    EncodedReserved,

    #[error("path climbs above the root")]
    EscapesRoot,
}

/// Canonical form of a request path, the form routes are matched against
/// and the form forwarded upstream.
///
/// - percent-encoded unreserved characters are decoded (`%2e` is `.`)
/// - remaining escapes are upper-cased; encoded `/`, `\` and control bytes
///   are refused
/// - empty and `.` segments are dropped, `..` removes its parent
/// - a trailing slash is kept
pub fn canonicalize_path(raw: &str) -> Result<String, PathError> {
    if !raw.starts_with('/') {
        return Err(PathError::NotAbsolute);
    }
    let decoded = decode_unreserved(raw)?;

    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;
    for segment in decoded.split('/').skip(1) {
        trailing_slash = matches!(segment, "" | "." | "..");
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop().ok_or(PathError::EscapesRoot)?;
            }
            _ => segments.push(segment),
        }
    }

    let mut path = String::with_capacity(decoded.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if trailing_slash || segments.is_empty() {
        path.push('/');
    }
    Ok(path)
}

fn decode_unreserved(raw: &str) -> Result<String, PathError> {
    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            let ch = raw[i..].chars().next().ok_or(PathError::BadEncoding)?;
            if ch.is_control() || ch == '\\' {
                return Err(PathError::EncodedReserved);
            }
            out.push(ch);
            i += ch.len_utf8();
            continue;
        }
        let hex = raw
            .get(i + 1..i + 3)
            .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or(PathError::BadEncoding)?;
        let byte = u8::from_str_radix(hex, 16).map_err(|_| PathError::BadEncoding)?;
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(char::from(byte));
            }
            b'/' | b'\\' | 0x00..=0x1f | 0x7f => return Err(PathError::EncodedReserved),
            _ => {
                out.push('%');
                out.push_str(&hex.to_ascii_uppercase());
            }
        }
        i += 3;
    }
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Resource templates
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum TemplatePart {
    Literal(String),
    Placeholder(String),
}

/// A resource id with optional `{capture}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTemplate {
    parts: Vec<TemplatePart>,
}

impl ResourceTemplate {
    pub fn parse(template: &str) -> Result<Self, RouteError> {
        let invalid = |reason: &str| RouteError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };
        if template.trim().is_empty() {
            return Err(invalid("must not be empty"));
        }

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(TemplatePart::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| invalid("unclosed '{'"))?;
            let name = &after[..close];
            if !is_identifier(name) {
                return Err(invalid(&format!("invalid placeholder '{name}'")));
            }
            parts.push(TemplatePart::Placeholder(name.to_string()));
            rest = &after[close + 1..];
        }
        if rest.contains('}') {
            return Err(invalid("unbalanced '}'"));
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Literal(rest.to_string()));
        }

        Ok(Self { parts })
    }

    /// Placeholder names used by this template.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Placeholder(name) => Some(name.as_str()),
            TemplatePart::Literal(_) => None,
        })
    }

    pub fn is_fixed(&self) -> bool {
        self.placeholders().next().is_none()
    }

    /// Render with the given captures. Placeholders are checked against the
    /// pattern at load time, so a missing capture renders empty.
    pub fn render(&self, captures: &HashMap<String, String>) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Literal(s) => out.push_str(s),
                TemplatePart::Placeholder(name) => {
                    if let Some(value) = captures.get(name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rules
// ─────────────────────────────────────────────────────────────────────────────

/// Access classification of a route, with the data each class needs.
#[derive(Debug, Clone)]
pub enum Classification {
    /// Forward without authentication or audit.
    Open,
    /// Any verified identity may pass; never queries policy.
    AuthenticatedOnly { resource: ResourceTemplate },
    /// The caller may access its own resource. Anyone else is checked against
    /// the fixed `others_resource` through a policy query.
    SelfPermission {
        resource: ResourceTemplate,
        uid_capture: String,
        others_resource: String,
    },
    /// Every request needs a policy allow.
    AclProtected { resource: ResourceTemplate },
}

impl Classification {
    pub fn name(&self) -> &'static str {
        match self {
            Classification::Open => "open",
            Classification::AuthenticatedOnly { .. } => "authenticated",
            Classification::SelfPermission { .. } => "self_permission",
            Classification::AclProtected { .. } => "acl",
        }
    }
}

/// Forwarding destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub id: String,
    base_url: String,
    strip_prefix: Option<String>,
}

impl UpstreamTarget {
    pub fn new(id: impl Into<String>, config: &UpstreamConfig) -> Self {
        Self {
            id: id.into(),
            base_url: config.url.trim_end_matches('/').to_string(),
            strip_prefix: config
                .strip_prefix
                .as_deref()
                .map(|p| p.trim_end_matches('/').to_string())
                .filter(|p| !p.is_empty()),
        }
    }

    /// Rewrite a request path onto this upstream.
    ///
    /// The strip prefix is only removed on a segment boundary; the query
    /// string is carried unchanged.
    pub fn target_uri(
        &self,
        path: &str,
        query: Option<&str>,
    ) -> Result<http::Uri, http::uri::InvalidUri> {
        let path = match &self.strip_prefix {
            Some(prefix) => match path.strip_prefix(prefix.as_str()) {
                Some("") => "/",
                Some(rest) if rest.starts_with('/') => rest,
                _ => path,
            },
            None => path,
        };

        let mut uri = format!("{}{}", self.base_url, path);
        if let Some(query) = query {
            uri.push('?');
            uri.push_str(query);
        }
        uri.parse()
    }
}

/// One compiled route.
#[derive(Debug)]
pub struct RouteRule {
    pub pattern: PathPattern,
    pub classification: Classification,
    pub upstream: Arc<UpstreamTarget>,
}

/// Result of matching a request path.
#[derive(Debug, Clone)]
pub struct RouteMatch {
    pub rule: Arc<RouteRule>,
    pub captures: HashMap<String, String>,
    /// What a caller must pass; `None` exactly when the route is open.
    pub guard: Option<Guard>,
}

impl RouteMatch {
    /// Rendered resource id of a protected route.
    pub fn resource_id(&self) -> Option<&str> {
        self.guard.as_ref().map(|g| g.resource_id.as_str())
    }
}

/// Protection of a matched route, rendered with the request's captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guard {
    pub resource_id: String,
    pub check: Check,
}

/// The check a verified caller still has to pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    AuthenticatedOnly,
    OwnResource {
        /// Uid named in the path.
        path_uid: Option<String>,
        others_resource: String,
    },
    Policy,
}

impl Guard {
    fn render(classification: &Classification, captures: &HashMap<String, String>) -> Option<Self> {
        let (resource, check) = match classification {
            Classification::Open => return None,
            Classification::AuthenticatedOnly { resource } => (resource, Check::AuthenticatedOnly),
            Classification::SelfPermission {
                resource,
                uid_capture,
                others_resource,
            } => (
                resource,
                Check::OwnResource {
                    path_uid: captures.get(uid_capture).cloned(),
                    others_resource: others_resource.clone(),
                },
            ),
            Classification::AclProtected { resource } => (resource, Check::Policy),
        };
        Some(Self {
            resource_id: resource.render(captures),
            check,
        })
    }
}

/// Immutable route table.
#[derive(Debug)]
pub struct RouteTable {
    rules: Vec<Arc<RouteRule>>,
    unmatched: Option<Arc<UpstreamTarget>>,
}

impl RouteTable {
    /// Compile every route; any invalid rule fails the whole table.
    pub fn from_config(config: &Config) -> Result<Self, RouteError> {
        let upstreams: BTreeMap<&str, Arc<UpstreamTarget>> = config
            .upstreams
            .iter()
            .map(|(id, u)| (id.as_str(), Arc::new(UpstreamTarget::new(id, u))))
            .collect();

        let mut rules = config
            .routes
            .iter()
            .map(|route| compile_rule(route, &upstreams).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        // Stable: equal specificity keeps declaration order.
        rules.sort_by_key(|r| r.pattern.specificity());

        let unmatched = config
            .unmatched_upstream
            .as_deref()
            .and_then(|id| upstreams.get(id).cloned());

        Ok(Self { rules, unmatched })
    }

    /// Find the most specific rule for `path` and render its guard.
    ///
    /// `path` must already be canonical (see [`canonicalize_path`]).
    pub fn match_path(&self, path: &str) -> Option<RouteMatch> {
        self.rules.iter().find_map(|rule| {
            let captures = rule.pattern.matches(path)?;
            let guard = Guard::render(&rule.classification, &captures);
            Some(RouteMatch {
                rule: Arc::clone(rule),
                captures,
                guard,
            })
        })
    }

    /// Upstream for paths no rule matches, if configured.
    pub fn unmatched_upstream(&self) -> Option<&Arc<UpstreamTarget>> {
        self.unmatched.as_ref()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

fn compile_rule(
    route: &RouteConfig,
    upstreams: &BTreeMap<&str, Arc<UpstreamTarget>>,
) -> Result<RouteRule, RouteError> {
    let pattern = PathPattern::parse(&route.path)?;
    let upstream = upstreams
        .get(route.upstream.as_str())
        .cloned()
        .ok_or_else(|| RouteError::UndefinedUpstream {
            pattern: route.path.clone(),
            upstream: route.upstream.clone(),
        })?;

    let resource = || -> Result<ResourceTemplate, RouteError> {
        let raw = route
            .resource
            .as_deref()
            .ok_or_else(|| RouteError::MissingResource {
                pattern: route.path.clone(),
            })?;
        let template = ResourceTemplate::parse(raw)?;
        let bound: HashSet<&str> = pattern.captures().iter().map(String::as_str).collect();
        if let Some(unbound) = template.placeholders().find(|p| !bound.contains(p)) {
            return Err(RouteError::UnboundPlaceholder {
                pattern: route.path.clone(),
                placeholder: unbound.to_string(),
            });
        }
        Ok(template)
    };

    let classification = match route.access {
        Access::Open => Classification::Open,
        Access::Authenticated => Classification::AuthenticatedOnly {
            resource: resource()?,
        },
        Access::Acl => Classification::AclProtected {
            resource: resource()?,
        },
        Access::SelfPermission => {
            let uid_capture =
                route
                    .uid_capture
                    .clone()
                    .ok_or_else(|| RouteError::MissingUidCapture {
                        pattern: route.path.clone(),
                    })?;
            if !pattern.captures().contains(&uid_capture) {
                return Err(RouteError::UnknownUidCapture {
                    pattern: route.path.clone(),
                    capture: uid_capture,
                });
            }
            let others_resource =
                route
                    .others_resource
                    .clone()
                    .ok_or_else(|| RouteError::MissingOthersResource {
                        pattern: route.path.clone(),
                    })?;
            if !ResourceTemplate::parse(&others_resource)?.is_fixed() {
                return Err(RouteError::TemplatedOthersResource {
                    pattern: route.path.clone(),
                    resource: others_resource,
                });
            }
            Classification::SelfPermission {
                resource: resource()?,
                uid_capture,
                others_resource,
            }
        }
    };

    Ok(RouteRule {
        pattern,
        classification,
        upstream,
    })
}
