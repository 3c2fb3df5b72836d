//! tmux driver - every terminal operation the runtime needs, via the `tmux` CLI
//!
//! The runtime only talks to [`TerminalDriver`], so tests can swap in an
//! in-memory terminal.

use super::theme::Theme;
use crate::config::TmuxConfig;
use crate::{GasTownError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Snapshot of one tmux session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub name: String,
    pub pane_id: String,
    pub attached: bool,
    pub windows: u32,
    pub activity: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait TerminalDriver: Send + Sync {
    async fn has_session(&self, name: &str) -> Result<bool>;

    async fn new_session(&self, name: &str, work_dir: Option<&Path>) -> Result<()>;

    async fn set_environment(&self, name: &str, key: &str, value: &str) -> Result<()>;

    /// Type text literally. Does not press Enter.
    async fn send_keys(&self, name: &str, text: &str) -> Result<()>;

    /// Press a named key (`Enter`, `C-c`, `Down`).
    async fn send_raw_key(&self, name: &str, key: &str) -> Result<()>;

    /// Last `lines` lines of the active pane.
    async fn capture_pane(&self, name: &str, lines: usize) -> Result<String>;

    async fn kill_session(&self, name: &str) -> Result<()>;

    async fn list_sessions(&self) -> Result<Vec<String>>;

    async fn session_info(&self, name: &str) -> Result<SessionInfo>;

    /// Foreground command of the active pane.
    async fn pane_command(&self, name: &str) -> Result<String>;

    async fn apply_theme(&self, name: &str, theme: &Theme, label: &str) -> Result<()>;
}

/// Production driver shelling out to the tmux binary.
pub struct Tmux {
    binary: String,
    timeout: Duration,
}

impl Tmux {
    pub fn new(config: &TmuxConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// Check if the tmux binary can be executed
    pub async fn is_available(&self) -> bool {
        self.output(&["-V"]).await.map(|o| o.status.success()).unwrap_or(false)
    }

    async fn output(&self, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => Err(GasTownError::BackendUnavailable(format!(
                "tmux {} timed out after {:?}",
                args.first().copied().unwrap_or_default(),
                self.timeout
            ))),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(
                GasTownError::BackendUnavailable(format!("{} not found", self.binary)),
            ),
            Ok(result) => Ok(result?),
        }
    }

    /// Run a command, failing on non-zero exit. Returns stdout.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(GasTownError::Upstream(format!(
                "tmux {}: {}",
                args.first().copied().unwrap_or_default(),
                stderr.trim()
            )))
        }
    }
}

/// Exact-match target so `gt-r1` never resolves to `gt-r1-w1`.
fn exact(name: &str) -> String {
    format!("={}", name)
}

/// Active pane of the exactly named session.
fn pane(name: &str) -> String {
    format!("={}:", name)
}

/// A concurrent start can win the race between `has-session` and `new-session`.
fn new_session_error(name: &str, stderr: &str) -> GasTownError {
    if stderr.contains("duplicate session") {
        GasTownError::SessionAlreadyExists(name.to_string())
    } else {
        GasTownError::Upstream(format!("tmux new-session: {}", stderr.trim()))
    }
}

fn no_server(stderr: &str) -> bool {
    stderr.contains("no server running") || stderr.contains("error connecting")
}

#[async_trait]
impl TerminalDriver for Tmux {
    async fn has_session(&self, name: &str) -> Result<bool> {
        let output = self.output(&["has-session", "-t", &exact(name)]).await?;
        Ok(output.status.success())
    }

    async fn new_session(&self, name: &str, work_dir: Option<&Path>) -> Result<()> {
        let dir = work_dir.map(|d| d.to_string_lossy().into_owned());
        let mut args = vec!["new-session", "-d", "-s", name];
        if let Some(dir) = dir.as_deref() {
            args.extend(["-c", dir]);
        }
        let output = self.output(&args).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(new_session_error(name, &String::from_utf8_lossy(&output.stderr)))
    }

    async fn set_environment(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.run(&["set-environment", "-t", &exact(name), key, value])
            .await
            .map(|_| ())
    }

    async fn send_keys(&self, name: &str, text: &str) -> Result<()> {
        self.run(&["send-keys", "-t", &pane(name), "-l", text])
            .await
            .map(|_| ())
    }

    async fn send_raw_key(&self, name: &str, key: &str) -> Result<()> {
        self.run(&["send-keys", "-t", &pane(name), key]).await.map(|_| ())
    }

    async fn capture_pane(&self, name: &str, lines: usize) -> Result<String> {
        let start = format!("-{}", lines);
        let out = self
            .run(&["capture-pane", "-p", "-t", &pane(name), "-S", &start])
            .await?;
        Ok(out.trim_end_matches('\n').to_string())
    }

    async fn kill_session(&self, name: &str) -> Result<()> {
        self.run(&["kill-session", "-t", &exact(name)]).await.map(|_| ())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let output = self.output(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if no_server(&stderr) {
                return Ok(Vec::new());
            }
            return Err(GasTownError::Upstream(format!(
                "tmux list-sessions: {}",
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn session_info(&self, name: &str) -> Result<SessionInfo> {
        let out = self
            .run(&[
                "display-message",
                "-p",
                "-t",
                &pane(name),
                "#{session_name}|#{pane_id}|#{session_attached}|#{session_windows}|#{session_activity}",
            ])
            .await?;
        parse_session_info(out.trim())
            .ok_or_else(|| GasTownError::Upstream(format!("unexpected tmux output: {}", out.trim())))
    }

    async fn pane_command(&self, name: &str) -> Result<String> {
        let out = self
            .run(&["display-message", "-p", "-t", &pane(name), "#{pane_current_command}"])
            .await?;
        Ok(out.trim().to_string())
    }

    async fn apply_theme(&self, name: &str, theme: &Theme, label: &str) -> Result<()> {
        let target = exact(name);
        let style = format!("bg={},fg={}", theme.bg, theme.fg);
        self.run(&["set-option", "-t", &target, "status-style", &style]).await?;
        self.run(&["set-option", "-t", &target, "status-left-length", "40"]).await?;
        self.run(&["set-option", "-t", &target, "status-left", label]).await?;
        Ok(())
    }
}

/// Parse `name|pane|attached|windows|activity`.
fn parse_session_info(line: &str) -> Option<SessionInfo> {
    let mut parts = line.split('|');
    let name = parts.next()?.to_string();
    let pane_id = parts.next()?.to_string();
    let attached = parts.next()?.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    let windows = parts.next()?.parse().unwrap_or(0);
    let activity = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

    Some(SessionInfo {
        name,
        pane_id,
        attached,
        windows,
        activity,
    })
}
