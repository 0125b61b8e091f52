//! mcplex gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Serve over stdio with the default config file (mcplex.toml)
//! mcplex-gateway --serve stdio
//!
//! # Serve the HTTP wrapper on a custom port
//! mcplex-gateway --config /etc/mcplex.toml --serve http --port 8080
//!
//! # Check configuration without connecting anything
//! mcplex-gateway --validate-only
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — path to the TOML configuration file
//! - `HOST` / `PORT` — override the HTTP wrapper bind address
//! - `RUST_LOG` — log filter, overriding `settings.log_level`
//!
//! Exit code is 0 on a normal shutdown and 1 on a fatal configuration
//! or startup error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use mcplex::PaymentMediator;
use mcplex::signer::CredentialSigner;
use mcplex_gateway::config::GatewayConfig;
use mcplex_gateway::frontend::{Gateway, GatewayInfo};
use mcplex_gateway::{http_binding, mcp_binding};
use mcplex_http::FacilitatorClient;
use mcplex_mcp::manager::{ConnectionManager, TransportConnector};
use mcplex_mcp::registry::CapabilityRegistry;
use mcplex_mcp::transport::{OutboundPayer, TransportFactory};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ServeMode {
    /// Standard MCP over stdin/stdout.
    Stdio,
    /// The HTTP wrapper (`POST /message`, `GET /sse`).
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "mcplex-gateway", version, about = "Payment-mediating MCP aggregation gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG", default_value = "mcplex.toml")]
    config: PathBuf,

    /// Downstream binding to serve.
    #[arg(long, value_enum, default_value = "http")]
    serve: ServeMode,

    /// Override the HTTP wrapper port.
    #[arg(long)]
    port: Option<u16>,

    /// Validate the configuration and exit without serving.
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match GatewayConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            // The subscriber is not up yet; this must reach the operator.
            #[allow(clippy::print_stderr)]
            {
                eprintln!("fatal: {err}");
            }
            std::process::exit(1);
        }
    };

    init_tracing(&config, cli.serve);

    if let Err(err) = run(cli, config).await {
        tracing::error!("gateway failed: {err}");
        std::process::exit(1);
    }
}

/// Installs the process-wide subscriber. The stdio binding owns stdout
/// for the MCP stream, so logs always go to stderr.
fn init_tracing(config: &GatewayConfig, _mode: ServeMode) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.settings.log_level.as_filter())),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, mut config: GatewayConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = cli.port {
        config.http.port = port;
    }

    let findings = config.validate_servers();
    for (id, issues) in &findings {
        for issue in issues {
            tracing::error!(server = %id, "invalid configuration: {issue}");
        }
    }
    if cli.validate_only {
        if findings.is_empty() {
            tracing::info!(
                servers = config.servers.len(),
                "configuration valid"
            );
            return Ok(());
        }
        return Err(format!("{} invalid server(s)", findings.len()).into());
    }

    tracing::info!(
        name = %config.name,
        servers = config.servers.len(),
        payments = config.payment.enabled,
        "starting gateway"
    );

    // Payment plumbing.
    let facilitator = FacilitatorClient::try_from(config.payment.facilitator_url.clone())?;
    let mediator = Arc::new(PaymentMediator::new(
        config.payment.clone(),
        Arc::new(facilitator),
    ));

    // Upstream plumbing; the outbound credential turns on the paying
    // fetcher for HTTP transports.
    let factory = match &config.payment.outbound {
        Some(outbound) => TransportFactory::with_payer(OutboundPayer {
            signer: Arc::new(CredentialSigner::new(outbound.credential.clone())),
            max_value: outbound.max_value,
        }),
        None => TransportFactory::new(),
    };
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(TransportConnector::new(factory)),
        config.settings.manager_settings(),
    ));
    let registry = Arc::new(CapabilityRegistry::new(
        config.settings.conflict_resolution(),
    ));

    let gateway = Arc::new(Gateway::new(
        GatewayInfo {
            name: config.name.clone(),
            version: config.version.clone(),
            description: config.description.clone(),
        },
        Arc::clone(&manager),
        registry,
        mediator,
    ));

    // Bring up upstreams; even zero successful connects is a valid
    // (empty) gateway.
    manager.initialize(config.servers.clone()).await;
    let stats = gateway.refresh_registry().await;
    tracing::info!(
        tools = stats.tools,
        resources = stats.resources,
        prompts = stats.prompts,
        "initial registry built"
    );

    let cancel = CancellationToken::new();
    let health_loop = manager.start_health_loop(cancel.clone());
    let registry_sync = Arc::clone(&gateway).spawn_registry_sync(cancel.clone());

    let serve_result = match cli.serve {
        ServeMode::Stdio => {
            tokio::select! {
                result = mcp_binding::serve_stdio(Arc::clone(&gateway)) => result,
                () = shutdown_signal() => Ok(()),
            }
        }
        ServeMode::Http => {
            let addr = SocketAddr::new(config.http.host, config.http.port);
            let http_cancel = cancel.clone();
            tokio::select! {
                result = http_binding::serve_http(Arc::clone(&gateway), addr, http_cancel) => result,
                () = shutdown_signal() => Ok(()),
            }
        }
    };

    tracing::info!("shutting down");
    cancel.cancel();
    let _ = health_loop.await;
    let _ = registry_sync.await;
    manager.close_all().await;
    serve_result?;
    tracing::info!("gateway stopped");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM (Unix).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => tracing::info!("received Ctrl-C"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl-C");
        tracing::info!("received Ctrl-C");
    }
}
