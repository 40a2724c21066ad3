//! ghb server - serves an in-memory repository over git smart HTTP.

use anyhow::Context;
use clap::Parser;
use ghb_server::observability::{init_logging, LogFormat};
use ghb_server::{Credentials, Server, ServerConfig};
use ghb_storage::Repository;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Git smart HTTP server
#[derive(Parser, Debug)]
#[command(name = "ghb-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen_addr: Option<SocketAddr>,

    /// Repository owner
    #[arg(long)]
    owner: Option<String>,

    /// Repository name
    #[arg(long)]
    repo: Option<String>,

    /// Upper bound in seconds for a single fetch or push
    #[arg(long)]
    session_timeout_secs: Option<u64>,

    /// Basic auth username (requires --password)
    #[arg(long, requires = "password")]
    username: Option<String>,

    /// Basic auth password (requires --username)
    #[arg(long, requires = "username")]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

impl Args {
    fn apply(self, config: &mut ServerConfig) {
        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(owner) = self.owner {
            config.owner = owner;
        }
        if let Some(repo) = self.repo {
            config.repo = repo;
        }
        if let Some(secs) = self.session_timeout_secs {
            config.session_timeout_secs = secs;
        }
        if let (Some(username), Some(password)) = (self.username, self.password) {
            config.auth = Some(Credentials::new(username, password));
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = LogFormat::parse(&format);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    args.apply(&mut config);

    init_logging(&config.log_level, config.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting ghb server");

    let store = Arc::new(Repository::new());
    let server = Server::new(store, &config.owner, &config.repo, config.options())
        .context("invalid server configuration")?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let addr = listener.local_addr()?;
    tracing::info!(
        %addr,
        url = %format!("http://{}/{}", addr, server.repo_path()),
        "Serving repository"
    );

    axum::serve(listener, server.router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
