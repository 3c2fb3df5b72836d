//! Gas Town configuration.
//!
//! Loaded from TOML. Every field has a default so an absent file, or a file
//! that only sets a couple of keys, still yields a usable config.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level service config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Runtime that serves API requests ("tmux" or "process")
    pub runtime: String,
    pub server: ServerConfig,
    pub tmux: TmuxConfig,
    pub process: ProcessConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            runtime: "tmux".to_string(),
            server: ServerConfig::default(),
            tmux: TmuxConfig::default(),
            process: ProcessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Terminal runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmuxConfig {
    /// tmux executable
    pub binary: String,
    /// Agent command launched inside new sessions
    pub command: String,
    /// Pane polling interval for synthesized streams
    pub poll_interval_ms: u64,
    /// Lines captured per poll
    pub capture_lines: usize,
    /// Total readiness budget, split across both phases
    pub ready_timeout_secs: u64,
    /// Prompt marker that signals the agent is ready for input
    pub ready_marker: String,
    /// Upper bound for any single tmux invocation
    pub command_timeout_secs: u64,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            command: "claude".to_string(),
            poll_interval_ms: 500,
            capture_lines: 50,
            ready_timeout_secs: 30,
            ready_marker: "❯".to_string(),
            command_timeout_secs: 30,
        }
    }
}

impl TmuxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Process runtime settings.
///
/// `api_key` selects the mode: present means direct API calls, absent means
/// one headless CLI subprocess per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    /// Admission ceiling; 0 falls back to the default of 10
    pub max_concurrent_sessions: usize,
    /// Bound on model calls per prompt while tools keep being requested
    pub max_tool_turns: usize,
    pub cli_binary: String,
    pub cli_args: Vec<String>,
    /// Flag carrying the system prompt to the CLI; `None` omits it
    pub cli_system_prompt_flag: Option<String>,
    /// How long a graceful stop waits before cancelling the session task
    pub stop_grace_secs: u64,
}

pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 10;

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            max_concurrent_sessions: DEFAULT_MAX_CONCURRENT_SESSIONS,
            max_tool_turns: 25,
            cli_binary: "claude".to_string(),
            cli_args: vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            cli_system_prompt_flag: Some("--system-prompt".to_string()),
            stop_grace_secs: 5,
        }
    }
}

impl ProcessConfig {
    pub fn ceiling(&self) -> usize {
        if self.max_concurrent_sessions == 0 {
            DEFAULT_MAX_CONCURRENT_SESSIONS
        } else {
            self.max_concurrent_sessions
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl AppConfig {
    /// Default config file location (`$XDG_CONFIG_HOME/gastown/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("gastown").join("config.toml"))
    }

    /// Load from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Load from `path` if given, else the default location, else defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from(path);
        }

        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.runtime, "tmux");
        assert_eq!(config.tmux.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.tmux.capture_lines, 50);
        assert_eq!(config.process.ceiling(), 10);
        assert!(config.process.api_key.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "runtime = \"process\"\n\n[process]\nmax_concurrent_sessions = 3\n\n[server]\naddr = \"0.0.0.0:9000\""
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.runtime, "process");
        assert_eq!(config.server.addr, "0.0.0.0:9000");
        assert_eq!(config.process.ceiling(), 3);
        assert_eq!(config.process.max_tokens, 4096);
        assert_eq!(config.tmux.command, "claude");
    }

    #[test]
    fn test_zero_ceiling_falls_back() {
        let config = ProcessConfig {
            max_concurrent_sessions: 0,
            ..Default::default()
        };
        assert_eq!(config.ceiling(), DEFAULT_MAX_CONCURRENT_SESSIONS);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "runtime = [").unwrap();
        let err = AppConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, crate::GasTownError::Config(_)));
    }
}
