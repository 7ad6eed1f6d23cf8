//! # Capman Service Binary
//!
//! Entry point for the capability manager: loads configuration, builds
//! the server, serves until interrupted, then tears down containers and
//! background tasks.
//!
//! ```bash
//! # Defaults: config capman.toml (optional), 127.0.0.1:5060
//! capman-service
//!
//! # Everything overridable
//! capman-service --config /etc/capman.toml --host 0.0.0.0 --port 8200 --log-level debug
//! ```

use clap::Parser;
use std::net::SocketAddr;

use capman_service::{config::Config, create_server};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Missing files fall back to
    /// defaults plus environment overrides.
    #[arg(short, long, default_value = "capman.toml")]
    config: String,

    /// Host address to bind; overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind; overrides the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Logging filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let (app, state) = create_server(config).await?;

    tracing::info!(%addr, "capability manager listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Containers and background tasks must not outlive the server.
    state.shutdown().await;
    Ok(())
}
