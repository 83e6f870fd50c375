use anyhow::Context;
use clap::Parser;
use keyrelay::config::ConfigLoader;
use keyrelay::server::{serve, AppState};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// OpenAI-compatible gateway with upstream key rotation
#[derive(Debug, Parser)]
#[command(name = "keyrelay", version, about)]
struct Args {
    /// Config file (default: $KEYRELAY_CONFIG, ./keyrelay.json, then the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,keyrelay=debug")),
        )
        .init();

    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigLoader::new().context("loading configuration")?,
    };

    let server = &loader.config().server;
    let host = args.host.clone().unwrap_or_else(|| server.host.clone());
    let port = args.port.unwrap_or(server.port);

    let state = AppState::new(loader).context("building gateway")?;
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {}:{}", host, port))?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c"),
        }
    });

    serve(listener, state, cancel).await
}
