//! Accept loop, per-connection handling and graceful drain.

use crate::error::ProxyResult;
use crate::logging_layer::logging_layer;
use crate::proxy_config::ProxyConfig;
use crate::proxy_service::{ClientAddr, ProxyService, UnifiedBody, respond};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{ServiceBuilder, ServiceExt};
use tracing::{debug, error, info, warn};

/// How the drain after a shutdown signal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: usize },
}

fn into_response(
    result: ProxyResult<Response<UnifiedBody>>,
) -> Result<Response<UnifiedBody>, Infallible> {
    Ok(respond(result))
}

/// Serve connections from `listener` until `shutdown` fires, then wait up to
/// `shutdown_timeout` for in-flight connections to finish.
pub async fn serve(
    listener: TcpListener,
    service: ProxyService,
    shutdown: CancellationToken,
) -> DrainResult {
    let config = service.config().clone();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_streams));
    let tracker = TaskTracker::new();

    let service_stack = ServiceBuilder::new()
        .layer(logging_layer())
        .service(tower::service_fn(move |req: Request<Incoming>| {
            let mut service = service.clone();
            async move { into_response(tower::Service::call(&mut service, req).await) }
        }));

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let permit = match semaphore.clone().try_acquire_owned() {
                            Ok(p) => p,
                            Err(_) => {
                                warn!(
                                    peer = %peer_addr,
                                    max_streams = config.max_concurrent_streams,
                                    "Rejected connection: max concurrent streams reached"
                                );
                                tokio::spawn(async move {
                                    let _ = send_503_response(stream).await;
                                });
                                continue;
                            }
                        };

                        if let Err(e) = configure_tcp_stream(&stream, &config) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        let service_stack = service_stack.clone();
                        let conn_shutdown = shutdown.clone();
                        let drain_timeout = config.shutdown_timeout;

                        tracker.spawn(async move {
                            handle_connection(
                                stream,
                                peer_addr,
                                service_stack,
                                conn_shutdown,
                                drain_timeout,
                            )
                            .await;
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    tracker.close();
    info!(
        active_connections = tracker.len(),
        drain_timeout_secs = config.shutdown_timeout.as_secs(),
        "Waiting for active connections to drain"
    );

    match tokio::time::timeout(config.shutdown_timeout, tracker.wait()).await {
        Ok(()) => DrainResult::Complete,
        Err(_) => DrainResult::Timeout {
            remaining: tracker.len(),
        },
    }
}

/// Serve one downstream connection.
///
/// CONNECT is refused before hyper sees the stream: the gate has to read
/// every request line.
async fn handle_connection<S, B>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) where
    S: tower::Service<Request<Incoming>, Response = Response<B>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut peek_buf = [0u8; 7];
    if let Ok(n) = stream.peek(&mut peek_buf).await
        && n >= 7
        && &peek_buf[..7] == b"CONNECT"
    {
        warn!(peer = %peer_addr, "Rejected CONNECT request");
        let _ = send_status_response(
            &mut stream,
            "405 Method Not Allowed",
            "405 Method Not Allowed\n\nTunnelling is not supported.",
            None,
        )
        .await;
        return;
    }

    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(ClientAddr(peer_addr));
        let svc = service.clone();
        async move {
            svc.oneshot(req).await.map(|response| {
                response.map(|body| {
                    body.map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
                        .boxed()
                })
            })
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            debug!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(drain_timeout, conn).await;
        }
    }
}

/// Apply TCP_NODELAY, keepalive and buffer sizes to an accepted stream.
fn configure_tcp_stream(stream: &TcpStream, config: &ProxyConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);

    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;

    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_send_buffer_size(config.socket_buffer_size)?;

    Ok(())
}

async fn send_503_response(mut stream: TcpStream) -> std::io::Result<()> {
    send_status_response(
        &mut stream,
        "503 Service Unavailable",
        "503 Service Unavailable\n\nConnection limit reached, retry shortly.",
        Some(1),
    )
    .await
}

async fn send_status_response(
    stream: &mut TcpStream,
    status_line: &str,
    body: &str,
    retry_after: Option<u64>,
) -> std::io::Result<()> {
    let retry = retry_after
        .map(|secs| format!("Retry-After: {secs}\r\n"))
        .unwrap_or_default();
    let response = format!(
        "HTTP/1.1 {status_line}\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         {retry}\
         \r\n\
         {body}",
        body.len(),
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
