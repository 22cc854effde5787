//! Shared fixtures for the authgate integration tests.
//!
//! - HS256 token minting
//! - A cluster-shaped config pointing at wiremock upstreams
//! - A `ProxyService` wired to an in-memory audit sink and a recording
//!   policy client

#![allow(dead_code)] // Not every test file uses every helper

use std::net::SocketAddr;
use std::sync::Arc;

use authgate_core::RequestGate;
use authgate_core::audit::{AuditLogger, MemoryAuditSink};
use authgate_core::config::{Config, parse_config};
use authgate_core::policy::{PolicyClient, RecordingPolicyClient};
use authgate_proxy::proxy_config::ProxyConfig;
use authgate_proxy::proxy_service::{ClientAddr, ProxyService, UnifiedBody};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use wiremock::MockServer;

pub const SECRET: &str = "integration-test-secret";

/// Base64 of `exhibitor:secret`, the credential configured for exhibitor.
pub const EXHIBITOR_CREDENTIAL: &str = "ZXhoaWJpdG9yOnNlY3JldA==";

/// `Authorization` value exhibitor must receive.
pub const EXHIBITOR_BASIC: &str = "Basic ZXhoaWJpdG9yOnNlY3JldA==";

pub fn token(uid: &str) -> String {
    let claims = serde_json::json!({
        "uid": uid,
        "exp": chrono::Utc::now().timestamp() + 300,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("token encodes")
}

/// Mock servers standing in for the cluster's services.
pub struct Upstreams {
    pub exhibitor: MockServer,
    pub iam: MockServer,
    pub ca: MockServer,
    pub ui: MockServer,
}

impl Upstreams {
    pub async fn start() -> Self {
        Self {
            exhibitor: MockServer::start().await,
            iam: MockServer::start().await,
            ca: MockServer::start().await,
            ui: MockServer::start().await,
        }
    }
}

/// Route table modelled on a cluster's admin router.
pub fn cluster_config(upstreams: &Upstreams, iam_url: &str) -> Config {
    let yaml = format!(
        r#"
schema: 1
auth:
  keys:
    - algorithm: HS256
      secret: {SECRET}
iam:
  url: {iam_url}
  timeout: 1s
upstreams:
  exhibitor:
    url: {exhibitor}
    strip_prefix: /exhibitor
    credential:
      basic: {EXHIBITOR_CREDENTIAL}
  iam:
    url: {iam}
  ca:
    url: {ca}
  ui:
    url: {ui}
  dead:
    url: http://127.0.0.1:1
routes:
  - path: /static/*
    access: open
    upstream: ui
  - path: /offline/*
    access: open
    upstream: dead
  - path: /exhibitor/*
    access: acl
    resource: dcos:adminrouter:ops:exhibitor
    upstream: exhibitor
  - path: /ca/api/v2/*
    access: acl
    resource: dcos:adminrouter:ops:ca:rw
    upstream: ca
  - path: /secrets/v1/*
    access: authenticated
    resource: dcos:adminrouter:secrets
    upstream: iam
  - path: /service/{{name}}/*
    access: acl
    resource: dcos:adminrouter:service:{{name}}
    upstream: ui
  - path: /acs/api/v1/users/{{uid}}/permissions
    access: self_permission
    resource: dcos:iam:users:{{uid}}:permissions
    uid_capture: uid
    others_resource: dcos:adminrouter:acs
    upstream: iam
"#,
        exhibitor = upstreams.exhibitor.uri(),
        iam = upstreams.iam.uri(),
        ca = upstreams.ca.uri(),
        ui = upstreams.ui.uri(),
    );
    parse_config(&yaml).expect("fixture config parses")
}

/// A proxy service plus the observers the tests assert on.
pub struct TestProxy {
    pub service: ProxyService,
    pub policy: Arc<RecordingPolicyClient>,
    pub audit: Arc<MemoryAuditSink>,
    pub upstreams: Upstreams,
}

impl TestProxy {
    pub async fn start(policy: RecordingPolicyClient) -> Self {
        let upstreams = Upstreams::start().await;
        let config = cluster_config(&upstreams, "http://127.0.0.1:1");
        let policy = Arc::new(policy);
        let audit = Arc::new(MemoryAuditSink::new());
        let service = build_service(&config, policy.clone(), audit.clone());
        Self {
            service,
            policy,
            audit,
            upstreams,
        }
    }

    pub async fn send(&self, request: Request<Full<Bytes>>) -> Response<UnifiedBody> {
        authgate_proxy::proxy_service::respond(self.service.handle_request(request).await)
    }
}

pub fn build_service(
    config: &Config,
    policy: Arc<dyn PolicyClient>,
    audit: Arc<MemoryAuditSink>,
) -> ProxyService {
    let gate = RequestGate::from_config(config, policy, AuditLogger::new(audit))
        .expect("gate builds from fixture config");
    ProxyService::new(Arc::new(gate), ProxyConfig::default()).expect("proxy service builds")
}

pub fn client_addr() -> ClientAddr {
    ClientAddr(SocketAddr::from(([10, 0, 0, 7], 51234)))
}

/// GET `uri`, optionally authenticated as `uid`, with a custom header that
/// must never reach an upstream.
pub fn get(uri: &str, uid: Option<&str>) -> Request<Full<Bytes>> {
    request("GET", uri, uid, Bytes::new())
}

/// Like [`get`], with any method and body.
pub fn request(method: &str, uri: &str, uid: Option<&str>, body: Bytes) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("accept", "application/json")
        .header("x-custom", "do-not-forward")
        .extension(client_addr());
    if let Some(uid) = uid {
        builder = builder.header("authorization", format!("token={}", token(uid)));
    }
    builder.body(Full::new(body)).expect("request builds")
}

pub async fn body_string(response: Response<UnifiedBody>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}
