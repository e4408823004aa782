//! verifytheme license admin server
//!
//! Serves the activation, deactivation and status endpoints the theme's
//! settings page talks to, backed by the remote license registry.
//!
//! Usage:
//!   verifytheme-admin --product-id 20473427 --domain shop.example.com

use std::{path::PathBuf, sync::Arc};
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use verifytheme_admin::{build_router, AdminState};
use verifytheme_license::{
    Clock, FileStore, HttpLicenseRegistry, KeyValueStore, LicenseConfig, LicenseRegistry,
    SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "verifytheme-admin")]
#[command(about = "verifytheme license activation admin API")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind the HTTP API to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// HTTP API port
    #[arg(short, long, default_value = "8089")]
    port: u16,

    /// This installation's domain (defaults to the request Host header)
    #[arg(short, long)]
    domain: Option<String>,

    /// Item id purchase codes must verify against
    #[arg(long)]
    product_id: Option<String>,

    /// License registry base URL
    #[arg(long)]
    api_base_url: Option<String>,

    /// Path of the option store file
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<LicenseConfig> {
    let mut config = match &args.config {
        Some(path) => LicenseConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => LicenseConfig::default(),
    };
    if let Some(product_id) = &args.product_id {
        config.product_id = product_id.clone();
    }
    if let Some(url) = &args.api_base_url {
        config.api_base_url = url.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("verifytheme admin starting...");
    let config = load_config(&args)?;

    let state_file = match &args.state_file {
        Some(path) => path.clone(),
        None => FileStore::default_path().context("no default state file location")?,
    };
    let store: Arc<dyn KeyValueStore> = Arc::new(
        FileStore::open(&state_file, SystemClock)
            .with_context(|| format!("failed to open {}", state_file.display()))?,
    );
    let registry: Arc<dyn LicenseRegistry> =
        Arc::new(HttpLicenseRegistry::new(&config).context("failed to build registry client")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!(
        product_id = %config.product_id,
        registry = %config.api_base_url,
        state_file = %state_file.display(),
        "license service configured"
    );

    let state = Arc::new(AdminState::new(config, store, registry, clock, args.domain.clone()));
    if state.manager().is_activated() {
        info!("installation has an active license");
    } else {
        info!("installation is not activated");
    }

    let app = build_router(state);
    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("admin API listening on {}", addr);
    axum::serve(listener, app).await.context("HTTP server failed")?;

    Ok(())
}
