use anyhow::{Context, Result};
use clap::Parser;
use gastown::api::{self, AppState};
use gastown::cli::{Cli, Commands};
use gastown::config::AppConfig;
use gastown::registry::RuntimeRegistry;
use gastown::runtime::{generate_session_id, AgentRole};
use std::sync::Arc;
use tracing::warn;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gastown=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, runtime } => {
            let mut config = AppConfig::load(cli.config.as_deref()).context("loading config")?;
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            if let Some(runtime) = runtime {
                config.runtime = runtime;
            }

            let registry = Arc::new(RuntimeRegistry::from_config(&config)?);
            let state = AppState::new(Arc::clone(&registry));

            let served = api::serve(state, &config.server.addr).await;
            if let Err(e) = registry.close_all().await {
                warn!(error = %e, "Runtime shutdown reported an error");
            }
            served?;
        }

        Commands::SessionId { role, team, worker } => {
            let role: AgentRole = role.parse()?;
            let id = generate_session_id(role, team.as_deref(), worker.as_deref())?;
            println!("{}", id);
        }
    }

    Ok(())
}
