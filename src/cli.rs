//! Binary entry: config load, component wiring, gateway serve.
//!
//! The shipped binary wires the built-in echo runtime and a no-op local
//! sandbox factory — the real LLM runtime and VM sandboxes are external
//! collaborators that embedders supply through [`crate::gateway::AppState::assemble`].

use crate::agent::mock::{EchoAgent, EchoAgentFactory};
use crate::config::Config;
use crate::gateway::{self, AppState};
use crate::sandbox::{NullSandboxFactory, SandboxKind};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Multi-agent orchestration service")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the gateway bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the gateway bind port.
    #[arg(long)]
    port: Option<u16>,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    info!("conductor {} starting", crate::VERSION);
    let state = AppState::assemble(
        &config,
        EchoAgent::new(),
        Arc::new(EchoAgentFactory),
        NullSandboxFactory::new(SandboxKind::Local),
    )?;
    gateway::serve(state, &config.gateway.host, config.gateway.port).await
}
