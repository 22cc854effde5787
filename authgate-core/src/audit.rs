//! Decision audit records.
//!
//! Every authenticated-or-rejected request produces exactly one audit line:
//!
//! ```text
//! type=audit timestamp=<rfc3339> authorizer=authgate object=<rid> action=<action> result=<allow|deny> reason="<reason>" srcip=<ip|-> request_uri=<uri> uid=<uid|->
//! ```
//!
//! Lines are written synchronously, before the response leaves the gate.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Log target for audit and identity lines.
pub const AUDIT_TARGET: &str = "authgate::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditResult {
    Allow,
    Deny,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Allow => "allow",
            AuditResult::Deny => "deny",
        }
    }
}

/// Fixed reason vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditReason {
    NotAuthenticated,
    PolicyResponse,
    AuthenticatedOnly,
    OwnPermissions,
}

impl AuditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditReason::NotAuthenticated => "not authenticated",
            AuditReason::PolicyResponse => "Bouncer PQ response",
            AuditReason::AuthenticatedOnly => "authenticated (all users are allowed to access)",
            AuditReason::OwnPermissions => "user requests his/her own permissions",
        }
    }
}

/// One terminal decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub object: String,
    pub action: String,
    pub result: AuditResult,
    pub reason: AuditReason,
    pub client_ip: Option<IpAddr>,
    pub request_uri: String,
    pub uid: Option<String>,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type=audit timestamp={} authorizer=authgate object=",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        write_value(f, &self.object)?;
        f.write_str(" action=")?;
        write_value(f, &self.action)?;
        write!(
            f,
            " result={} reason=\"{}\" srcip=",
            self.result.as_str(),
            self.reason.as_str(),
        )?;
        match self.client_ip {
            Some(ip) => write!(f, "{ip}")?,
            None => f.write_str("-")?,
        }
        f.write_str(" request_uri=")?;
        write_value(f, &self.request_uri)?;
        f.write_str(" uid=")?;
        match &self.uid {
            Some(uid) => write_value(f, uid),
            None => f.write_str("-"),
        }
    }
}

/// A value that is one printable ASCII token is written bare; anything else
/// is quoted and escaped so it stays a single field on a single line.
fn write_value(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    let bare = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '"' && c != '\\');
    if bare {
        f.write_str(value)
    } else {
        write!(f, "{value:?}")
    }
}

/// Destination for audit lines.
pub trait AuditSink: Send + Sync {
    /// Write one line. Must not return before the line is handed to the
    /// underlying writer.
    fn write_line(&self, line: &str);
}

/// Emits lines through `tracing` under [`AUDIT_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn write_line(&self, line: &str) {
        info!(target: AUDIT_TARGET, "{line}");
    }
}

/// Collects lines in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    lines: Mutex<Vec<String>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines starting with `type=audit`.
    pub fn audit_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.starts_with("type=audit"))
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Writes identity and decision lines to a sink.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLogger").finish_non_exhaustive()
    }
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Diagnostic line emitted after a successful authentication.
    pub fn identity_verified(&self, uid: &str) {
        self.sink
            .write_line(&format!("UID from valid JWT: `{}`", uid.escape_debug()));
    }

    pub fn record(&self, event: &AuditEvent) {
        self.sink.write_line(&event.to_string());
    }
}
