//! `cohortd` — the cohort study server daemon.
//!
//! Loads the server configuration, opens the study store, and serves
//! the participant and admin HTTP APIs until shutdown.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cohort_server::{AppState, ServerConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cohortd", about = "Study session and run lifecycle server")]
struct Args {
    /// Path to the JSON server configuration. Missing file means defaults.
    #[arg(long, default_value = "cohort.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    cohort_core::logging::init("info,cohort_server=debug");

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(
        AppState::from_config(&config).with_context(|| "opening study store")?,
    );
    let app = cohort_server::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, data_root = %config.data_root.display(), "cohortd listening");

    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}
