//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "gastown")]
#[command(about = "Lifecycle manager for AI-agent workers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to ~/.config/gastown/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the REST/WebSocket gateway
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        addr: Option<String>,

        /// Active runtime: tmux or process (overrides config)
        #[arg(short, long)]
        runtime: Option<String>,
    },

    /// Print the session id for an identity
    SessionId {
        /// mayor, deacon, witness, refinery, polecat, crew
        #[arg(long)]
        role: String,

        /// Team (rig) name
        #[arg(long, alias = "rig")]
        team: Option<String>,

        /// Worker name (polecat or crew)
        #[arg(long)]
        worker: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::parse_from(["gastown", "--config", "/tmp/gt.toml", "serve", "--runtime", "process"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/gt.toml")));
        match cli.command {
            Commands::Serve { addr, runtime } => {
                assert!(addr.is_none());
                assert_eq!(runtime.as_deref(), Some("process"));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_session_id_accepts_rig_alias() {
        let cli = Cli::parse_from(["gastown", "session-id", "--role", "crew", "--rig", "r1", "--worker", "max"]);
        match cli.command {
            Commands::SessionId { role, team, worker } => {
                assert_eq!(role, "crew");
                assert_eq!(team.as_deref(), Some("r1"));
                assert_eq!(worker.as_deref(), Some("max"));
            }
            _ => panic!("expected session-id"),
        }
    }
}
