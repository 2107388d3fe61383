use anyhow::{Context, Result};
use clap::Parser;
use seekr_core::{Config, Seekr};
use seekr_server::build_app;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// TOML configuration file
    #[arg(long, default_value = "seekr.toml")]
    config: PathBuf,
    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8080)]
    port: u16,
    /// Watch the configured paths for changes
    #[arg(long, default_value_t = false)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();
    let config = Config::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    let seekr = Arc::new(tokio::task::spawn_blocking(move || Seekr::open(config)).await??);
    tracing::info!(startup = ?seekr.startup(), "index opened");
    if args.watch {
        seekr.watch_start(Vec::new())?;
    }
    let app = build_app(seekr.clone());

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    tokio::task::spawn_blocking(move || seekr.shutdown()).await?;
    Ok(())
}
