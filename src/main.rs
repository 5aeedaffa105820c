//! EdgeProxy - Main entry point
//!
//! A TLS-terminating reverse proxy with host/path routing

use anyhow::{Context, Result};
use clap::Parser;
use edgeproxy::{CertStore, ProxyConfig, ProxyServer, RouteTable};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// EdgeProxy - A TLS-terminating reverse proxy
#[derive(Parser, Debug)]
#[command(name = "edgeproxy")]
#[command(author = "EdgeProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A TLS-terminating reverse proxy with host/path routing")]
struct Args {
    /// HTTP port to listen on (redirects everything to HTTPS)
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Routing table file (ordered JSON object; declaration order decides
    /// precedence, last match wins)
    #[arg(long, env = "ROUTES_FILE", default_value = "./routing.json")]
    routes_file: PathBuf,

    /// Certificate root directory (certbot live layout)
    #[arg(long, env = "CERTS_DIR", default_value = "/etc/letsencrypt/live")]
    certs_dir: PathBuf,

    /// Domain whose certificate is presented when a client sends no SNI or
    /// an unknown name. Without it such handshakes are rejected.
    #[arg(long, env = "DEFAULT_DOMAIN")]
    default_domain: Option<String>,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting EdgeProxy v1.0.0");

    // Both tables are fully built before any listener accepts a connection
    let routes = Arc::new(
        RouteTable::load(&args.routes_file)
            .with_context(|| format!("cannot load routes from {}", args.routes_file.display()))?,
    );
    info!(
        "Loaded {} routes from {}",
        routes.len(),
        args.routes_file.display()
    );

    let certs = Arc::new(CertStore::load(&args.certs_dir, args.default_domain)?);
    info!(
        "Loaded {} certificates from {}",
        certs.len(),
        args.certs_dir.display()
    );

    let config = ProxyConfig {
        http_port: args.http_port,
        https_port: args.https_port,
    };

    let server = Arc::new(ProxyServer::new(config, routes, certs));

    info!("EdgeProxy started successfully");

    server.run().await?;

    Ok(())
}
