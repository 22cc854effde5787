//! HTTP side of the enforcement proxy.
//!
//! [`ProxyService`] turns an inbound request into a [`GateRequest`], lets the
//! [`RequestGate`] decide, and either streams the request to the chosen
//! upstream or answers with the rejection status. The decision runs in its
//! own task so that a client hanging up mid-request cannot cut an audit
//! record short.

use crate::error::{ProxyError, ProxyResult};
use crate::proxy_config::ProxyConfig;
use authgate_core::{ForwardPlan, GateRequest, RequestGate, Verdict};
use bytes::Bytes;
use futures_util::StreamExt;
use http::HeaderMap;
use http_body_util::{BodyExt, BodyStream, StreamBody};
use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::Service;
use tracing::{debug, error, warn};

/// Type alias for the client's streaming body type.
type ClientBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Body type of every response the proxy writes.
///
/// Upstream responses stream through; rejections are small buffered bodies.
/// Both are boxed for a unified return type.
pub type UnifiedBody = http_body_util::combinators::BoxBody<Bytes, ProxyError>;

/// Peer address of the downstream connection, attached to each request as
/// an extension by the accept loop.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Gate-driven reverse proxy.
#[derive(Clone)]
pub struct ProxyService {
    client: Client<HttpsConnector<HttpConnector>, ClientBody>,
    gate: Arc<RequestGate>,
    config: ProxyConfig,
}

impl ProxyService {
    /// Build the service and its pooled upstream client.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Connection` if no rustls crypto provider can be
    /// installed.
    pub fn new(gate: Arc<RequestGate>, config: ProxyConfig) -> ProxyResult<Self> {
        static RUSTLS_INIT: std::sync::OnceLock<Result<(), ()>> = std::sync::OnceLock::new();
        let init_result = RUSTLS_INIT.get_or_init(|| {
            rustls::crypto::ring::default_provider()
                .install_default()
                .map_err(|_| ())
        });
        // Another component may have installed a provider first; only fail
        // when none is available at all.
        if init_result.is_err() && rustls::crypto::CryptoProvider::get_default().is_none() {
            return Err(ProxyError::Connection(
                "Failed to install rustls crypto provider".into(),
            ));
        }

        let mut http_connector = HttpConnector::new();
        http_connector.set_nodelay(config.tcp_nodelay);
        http_connector.enforce_http(false);

        let roots = match HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "No native TLS roots, falling back to bundled webpki roots");
                HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let https_connector = roots
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(https_connector);

        Ok(Self {
            client,
            gate,
            config,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    /// Decide on a request and, when admitted, forward it.
    ///
    /// # Errors
    ///
    /// `ProxyError::Rejected` carries the gate's refusal; the other variants
    /// describe upstream failures after admission.
    pub async fn handle_request<B>(&self, req: Request<B>) -> ProxyResult<Response<UnifiedBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let gate_request = GateRequest {
            path: req.uri().path().to_string(),
            request_uri: req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
            headers: req.headers().clone(),
            client_ip: req.extensions().get::<ClientAddr>().map(|a| a.0.ip()),
        };

        // Detached so the audit record is written even if this future is
        // dropped because the client went away.
        let gate = self.gate.clone();
        let verdict = tokio::spawn(async move { gate.decide(&gate_request).await })
            .await
            .map_err(|e| {
                error!(error = %e, "Decision task failed");
                ProxyError::Internal(format!("decision task failed: {e}"))
            })?;

        match verdict {
            Verdict::Forward(plan) => self.forward(req, plan).await,
            Verdict::Reject(reason) => Err(ProxyError::Rejected(reason)),
        }
    }

    async fn forward<B>(&self, req: Request<B>, plan: ForwardPlan) -> ProxyResult<Response<UnifiedBody>>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let target_uri = plan
            .upstream
            .target_uri(&plan.path, req.uri().query())
            .map_err(|e| ProxyError::InvalidUri(format!("Failed to build upstream URI: {e}")))?;

        debug!(
            method = %req.method(),
            upstream = %plan.upstream.id,
            target = %target_uri,
            "Forwarding request"
        );

        let (parts, body) = req.into_parts();

        let mut upstream_req = Request::builder().method(parts.method).uri(target_uri);
        let headers = upstream_req.headers_mut().ok_or_else(|| {
            error!("Failed to get mutable headers from request builder");
            ProxyError::Internal("Request builder in invalid state".to_string())
        })?;
        *headers = strip_hop_by_hop(plan.headers);

        let body_stream = BodyStream::new(body);
        let mapped_stream = body_stream.map(|result| {
            result.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
        });
        let boxed_body: ClientBody = BodyExt::boxed(StreamBody::new(mapped_stream));

        let upstream_req = upstream_req.body(boxed_body).map_err(|e| {
            error!(error = %e, "Failed to build upstream request");
            ProxyError::Internal(format!("Failed to build request: {e}"))
        })?;

        let upstream_res =
            match tokio::time::timeout(self.config.request_timeout, self.client.request(upstream_req))
                .await
            {
                Ok(result) => result.map_err(map_hyper_error)?,
                Err(_) => {
                    warn!(
                        upstream = %plan.upstream.id,
                        timeout_secs = self.config.request_timeout.as_secs(),
                        "Upstream did not respond in time"
                    );
                    return Err(ProxyError::Timeout(format!(
                        "upstream {} exceeded {:?}",
                        plan.upstream.id, self.config.request_timeout
                    )));
                }
            };

        let (mut parts, body) = upstream_res.into_parts();
        parts.headers = strip_hop_by_hop(parts.headers);

        let body_stream = BodyStream::new(body);
        let mapped_stream = body_stream.map(|result| {
            result.map_err(|e| ProxyError::Connection(format!("Body stream error: {e}")))
        });
        let boxed_body: UnifiedBody = BodyExt::boxed(StreamBody::new(mapped_stream));

        Ok(Response::from_parts(parts, boxed_body))
    }
}

impl Service<Request<Incoming>> for ProxyService {
    type Response = Response<UnifiedBody>;
    type Error = ProxyError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { service.handle_request(req).await })
    }
}

/// Render a handler result as the response written to the client.
pub fn respond(result: ProxyResult<Response<UnifiedBody>>) -> Response<UnifiedBody> {
    match result {
        Ok(response) => response,
        Err(e) => {
            match &e {
                ProxyError::Rejected(_) => debug!(error = %e, "Request rejected"),
                _ => error!(error = %e, "Service error"),
            }
            e.to_response().map(|body| body.map_err(|e| match e {}).boxed())
        }
    }
}

/// Headers that describe a single connection and must not cross the proxy.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn strip_hop_by_hop(headers: HeaderMap) -> HeaderMap {
    // Names listed in Connection are hop-by-hop too.
    let listed: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    let mut current = None;
    for (name, value) in headers {
        if let Some(name) = name {
            current = Some(name);
        }
        let Some(name) = current.as_ref() else {
            continue;
        };
        if is_hop_by_hop_header(name.as_str()) || listed.iter().any(|l| l == name.as_str()) {
            continue;
        }
        out.append(name.clone(), value);
    }
    out
}

/// Map hyper_util client errors to appropriate ProxyError variants.
///
/// # Error Mapping
/// - Connection refused -> `ProxyError::ConnectionRefused` (502)
/// - Timeout -> `ProxyError::Timeout` (504)
/// - Other errors -> `ProxyError::Connection` (502)
fn map_hyper_error(e: hyper_util::client::legacy::Error) -> ProxyError {
    let error_msg = format!("{e:?}").to_lowercase();

    if error_msg.contains("connection refused") || error_msg.contains("connectionrefused") {
        warn!(error = %e, "Upstream connection refused");
        return ProxyError::ConnectionRefused(format!("Upstream refused connection: {e}"));
    }

    if error_msg.contains("timeout") || error_msg.contains("timed out") {
        warn!(error = %e, "Upstream timeout");
        return ProxyError::Timeout(format!("Upstream timeout: {e}"));
    }

    if e.is_connect() {
        warn!(error = %e, "Upstream connection failed");
        return ProxyError::Connection(format!("Failed to connect to upstream: {e}"));
    }

    warn!(error = %e, "Upstream error");
    ProxyError::Connection(format!("Upstream error: {e}"))
}
