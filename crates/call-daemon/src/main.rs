#![deny(unsafe_code)]
use anyhow::{Context, Result};
use call_config::load_config;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "call-daemon", version, about = "CALL protocol daemon")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults, then
    /// `CALL_*` environment overrides, when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Enable verbose request/response debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("load config")?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if args.debug {
        config.debug = true;
    }

    let filter = if config.debug {
        EnvFilter::new("call=debug,call_dispatch=debug,call_daemon=debug")
    } else {
        EnvFilter::new("call=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = call_daemon::build_state(&config);
    let app = call_daemon::build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(bind = %config.bind_addr, "call-daemon listening");

    axum::serve(listener, app).await.context("serve")
}
