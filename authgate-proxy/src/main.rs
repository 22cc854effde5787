//! authgate: authentication and authorization gate in front of cluster
//! services.
//!
//! Every request is classified by path, authenticated from its JWT, checked
//! against the IAM policy service where the route demands it, audited, and
//! then either forwarded to its upstream or rejected.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use authgate_core::RequestGate;
use authgate_core::audit::{AuditLogger, TracingAuditSink};
use authgate_core::config::{find_config_file, load_and_validate};
use authgate_core::policy::IamPolicyClient;
use authgate_proxy::logging_layer::env_filter;
use authgate_proxy::proxy_config::ProxyConfig;
use authgate_proxy::proxy_service::ProxyService;
use authgate_proxy::server::{DrainResult, serve};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Listen port
    #[arg(short, long, env = "AUTHGATE_PORT", default_value_t = 8080)]
    port: u16,

    /// Path to the YAML configuration file.
    /// If not specified, searches: AUTHGATE_CONFIG env, /etc/authgate/config.yaml, ./config.yaml
    #[arg(long, env = "AUTHGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, env = "AUTHGATE_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Synchronous stderr writer: audit lines reach the log before the
    // response leaves. The audit target ignores RUST_LOG.
    let filter = env_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    match cli.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    let config_path = find_config_file(cli.config.as_deref())?;
    info!(path = %config_path.display(), "Loading configuration file");
    let (config, validation) = load_and_validate(&config_path)?;
    for warning in &validation.warnings {
        warn!(warning = %warning, "Configuration warning");
    }

    let proxy_config = ProxyConfig::from_env();

    let policy = Arc::new(IamPolicyClient::new(&config.iam)?);
    let audit = AuditLogger::new(Arc::new(TracingAuditSink));
    let gate = Arc::new(RequestGate::from_config(&config, policy, audit)?);
    info!(
        routes = gate.routes().rule_count(),
        upstreams = config.upstreams.len(),
        iam = %config.iam.url,
        "Request gate ready"
    );

    let service = ProxyService::new(gate, proxy_config.clone())?;

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        tcp_nodelay = proxy_config.tcp_nodelay,
        tcp_keepalive_secs = proxy_config.tcp_keepalive_secs,
        max_concurrent_streams = proxy_config.max_concurrent_streams,
        request_timeout_secs = proxy_config.request_timeout.as_secs(),
        "authgate listening"
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    match serve(listener, service, shutdown).await {
        DrainResult::Complete => {
            info!("All connections drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => {
            Err(format!("Drain timeout exceeded with {remaining} open connections").into())
        }
    }
}

/// SIGINT and SIGTERM both start a graceful shutdown.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = shutdown;
}
