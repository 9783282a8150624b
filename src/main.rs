//! # mirage
//!
//! Server binary: loads configuration, wires the store, model clients and
//! image cache together and serves until Ctrl-C.

#![deny(unsafe_code)]

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mirage_core::clock::{SystemClock, UuidIds};
use mirage_llm::{OpenAiCompatClient, OpenAiImageClient};
use mirage_server::AppState;
use mirage_store::{ImageCache, SessionStore};

use crate::config::{config_path, AppConfig};

/// LLM-rendered web app server.
#[derive(Parser, Debug)]
#[command(name = "mirage", about = "Serve an app whose pages are generated by a language model")]
struct Cli {
    /// Config file (defaults to ~/.mirage/config.json).
    #[arg(long, env = "MIRAGE_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Description of the app the model should build.
    #[arg(long)]
    brief: Option<String>,

    /// Log level (RUST_LOG takes precedence).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(brief) = &self.brief {
            config.runtime.brief = Some(brief.clone());
        }
        if let Some(level) = &self.log_level {
            config.telemetry.level = level.clone();
        }
        if self.log_json {
            config.telemetry.json = true;
        }
    }
}

fn build_state(config: &AppConfig) -> Result<AppState> {
    let store = SessionStore::new(config.store_config(), Arc::new(SystemClock::new()), Arc::new(UuidIds));
    let images = match &config.runtime.generated_images_dir {
        Some(dir) => ImageCache::with_dir(dir),
        None => ImageCache::new(),
    };
    let mut state = AppState::new(Arc::new(store), Arc::new(images), config.runtime_options());

    match config.client_settings() {
        Some(settings) => {
            let client = OpenAiCompatClient::new(settings).context("Failed to create model client")?;
            state = state.with_llm(Arc::new(client));
        }
        None => tracing::warn!(
            provider = %config.provider.provider,
            "no API key configured; page and query routes will answer 503"
        ),
    }

    let image_settings = config.image_settings();
    if image_settings.enabled {
        let client = OpenAiImageClient::new(
            config.image_generation.provider,
            config.image_generation.base_url.as_deref(),
        )
        .context("Failed to create image client")?;
        state = state.with_image_gen(Arc::new(client), image_settings);
    }
    Ok(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config_path);
    let mut config = AppConfig::load_from(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    cli.apply(&mut config);

    let _telemetry = mirage_telemetry::init_telemetry(config.telemetry.clone())
        .context("Failed to initialize logging")?;
    tracing::info!(config = %path.display(), model = %config.provider.model, "configuration loaded");

    let state = build_state(&config)?;
    if state.runtime().brief().is_none() {
        tracing::warn!("no brief configured; set runtime.brief or pass --brief");
    }

    let handle = mirage_server::start(config.server_config(), state)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, "listening");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}
