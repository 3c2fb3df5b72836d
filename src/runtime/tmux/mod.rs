//! Terminal-backed runtime.
//!
//! Each worker is an agent CLI running in its own tmux session, named by the
//! session-id grammar. tmux has no notion of responses, so the stream is
//! synthesized by polling the pane and emitting whatever text appeared since
//! the previous poll. That stream is lossy: output that scrolls past the
//! capture window between two polls is never seen.

pub mod driver;
pub mod theme;

pub use driver::{SessionInfo, TerminalDriver, Tmux};

use super::session_id::{generate_session_id, parse_session_id};
use super::types::*;
use super::{AgentRuntime, ResponseStream};
use crate::config::TmuxConfig;
use crate::{GasTownError, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

const RUNTIME_TYPE: &str = "tmux";

/// Foreground commands that mean the agent is not (yet) running.
const SHELLS: [&str; 8] = ["bash", "zsh", "sh", "fish", "tcsh", "csh", "ksh", "dash"];

const BYPASS_DIALOG: &str = "Bypass Permissions mode";

/// Fixed pauses used while driving the terminal.
#[derive(Debug, Clone, Copy)]
pub struct Delays {
    /// Between typing a prompt and pressing Enter
    pub prompt_debounce: Duration,
    /// Between Ctrl-C and kill on graceful stop
    pub interrupt_grace: Duration,
    /// Between stop and start on restart
    pub restart_pause: Duration,
    /// Before delivering the initial prompt
    pub settle: Duration,
    /// Readiness polling interval
    pub ready_poll: Duration,
}

impl Default for Delays {
    fn default() -> Self {
        Self {
            prompt_debounce: Duration::from_millis(500),
            interrupt_grace: Duration::from_millis(100),
            restart_pause: Duration::from_millis(500),
            settle: Duration::from_secs(2),
            ready_poll: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
struct TrackedSession {
    session: AgentSession,
    last_prompt: Option<String>,
}

pub struct TmuxRuntime {
    driver: Arc<dyn TerminalDriver>,
    config: TmuxConfig,
    delays: Delays,
    sessions: RwLock<HashMap<String, TrackedSession>>,
}

impl TmuxRuntime {
    pub fn new(config: TmuxConfig) -> Self {
        let driver = Arc::new(Tmux::new(&config));
        Self::with_driver(driver, config)
    }

    pub fn with_driver(driver: Arc<dyn TerminalDriver>, config: TmuxConfig) -> Self {
        Self {
            driver,
            config,
            delays: Delays::default(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_delays(mut self, delays: Delays) -> Self {
        self.delays = delays;
        self
    }

    /// argv that attaches a terminal to the session.
    pub fn attach_command(&self, session_id: &str) -> Vec<String> {
        vec![
            self.config.binary.clone(),
            "attach-session".to_string(),
            "-t".to_string(),
            session_id.to_string(),
        ]
    }

    fn tracked(&self, session_id: &str) -> Option<TrackedSession> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    fn untrack(&self, session_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    async fn require_session(&self, session_id: &str) -> Result<()> {
        if self.driver.has_session(session_id).await? {
            Ok(())
        } else {
            Err(GasTownError::SessionNotFound(session_id.to_string()))
        }
    }

    async fn set_environment(&self, session_id: &str, role: AgentRole, opts: &StartOptions) {
        let mut vars = identity_env(role, opts);
        if let Some(dir) = &opts.config_dir {
            vars.push(("CLAUDE_CONFIG_DIR".to_string(), dir.to_string_lossy().into_owned()));
        }
        if let Some(account) = &opts.account {
            vars.push(("GT_ACCOUNT".to_string(), account.clone()));
        }
        let mut overrides: Vec<_> = opts.environment.iter().collect();
        overrides.sort();
        vars.extend(overrides.into_iter().map(|(k, v)| (k.clone(), v.clone())));

        for (key, value) in vars {
            if let Err(e) = self.driver.set_environment(session_id, &key, &value).await {
                warn!(session = %session_id, key = %key, error = %e, "Failed to set environment");
            }
        }
    }

    async fn apply_theme(&self, session_id: &str, role: AgentRole, opts: &StartOptions) {
        let theme = if role.is_town() {
            theme::TOWN_THEME
        } else {
            theme::assign_theme(opts.team.as_deref())
        };
        let label = theme::status_label(role.as_str(), opts.team.as_deref(), opts.worker.as_deref());
        if let Err(e) = self.driver.apply_theme(session_id, &theme, &label).await {
            warn!(session = %session_id, error = %e, "Failed to apply theme");
        }
    }

    /// Type text, pause, press Enter.
    async fn nudge(&self, session_id: &str, text: &str) -> Result<()> {
        self.driver.send_keys(session_id, text).await?;
        tokio::time::sleep(self.delays.prompt_debounce).await;
        self.driver.send_raw_key(session_id, "Enter").await
    }

    /// Two phases, each with half the budget: the agent replaces the shell,
    /// then the agent shows its prompt marker.
    async fn wait_for_ready(&self, session_id: &str, timeout: Duration) {
        let half = timeout / 2;

        let deadline = Instant::now() + half;
        let mut started = false;
        while Instant::now() < deadline {
            if let Ok(cmd) = self.driver.pane_command(session_id).await {
                if !is_shell(&cmd) {
                    started = true;
                    break;
                }
            }
            tokio::time::sleep(self.delays.ready_poll).await;
        }
        if !started {
            warn!(session = %session_id, "Agent command did not start within {:?}", half);
            return;
        }

        let deadline = Instant::now() + half;
        while Instant::now() < deadline {
            if let Ok(screen) = self.driver.capture_pane(session_id, self.config.capture_lines).await {
                if screen.contains(&self.config.ready_marker) {
                    debug!(session = %session_id, "Agent ready");
                    return;
                }
            }
            tokio::time::sleep(self.delays.ready_poll).await;
        }
        warn!(session = %session_id, "Agent prompt not seen within {:?}", half);
    }

    /// Accept the bypass-permissions confirmation if the agent is showing it.
    async fn dismiss_bypass_dialog(&self, session_id: &str) {
        let Ok(screen) = self.driver.capture_pane(session_id, self.config.capture_lines).await else {
            return;
        };
        if !screen.contains(BYPASS_DIALOG) {
            return;
        }
        debug!(session = %session_id, "Accepting bypass permissions dialog");
        if self.driver.send_raw_key(session_id, "Down").await.is_ok() {
            tokio::time::sleep(self.delays.ready_poll).await;
            let _ = self.driver.send_raw_key(session_id, "Enter").await;
        }
    }

    async fn session_status(&self, session_id: &str, mut session: AgentSession) -> AgentStatus {
        session.running = true;
        let info = self.driver.session_info(session_id).await.ok();
        let pane_command = self.driver.pane_command(session_id).await.ok();

        let health = match pane_command.as_deref() {
            Some(cmd) if !is_shell(cmd) => HealthState::Healthy,
            _ => HealthState::Degraded,
        };

        let last_activity = info
            .as_ref()
            .and_then(|i| i.activity)
            .unwrap_or_else(Utc::now);
        let mut activity = ActivityInfo::since(last_activity);
        activity.last_prompt = self.tracked(session_id).and_then(|t| t.last_prompt);

        let tmux = info.map(|info| TmuxStatus {
            session_name: info.name,
            pane_id: info.pane_id,
            attached: info.attached,
            windows: info.windows,
            pane_command: pane_command.unwrap_or_default(),
        });

        AgentStatus {
            session,
            health,
            activity,
            tmux,
            process: None,
        }
    }
}

/// Identity variables for the agent: role, team, and worker name.
fn identity_env(role: AgentRole, opts: &StartOptions) -> Vec<(String, String)> {
    let mut vars = vec![("GT_ROLE".to_string(), role.to_string())];
    if let Some(team) = &opts.team {
        vars.push(("GT_RIG".to_string(), team.clone()));
    }
    if let Some(worker) = &opts.worker {
        match role {
            AgentRole::Polecat => vars.push(("GT_POLECAT".to_string(), worker.clone())),
            AgentRole::Crew => vars.push(("GT_CREW".to_string(), worker.clone())),
            _ => {}
        }
    }
    vars
}

/// `export K=V ... && command args`. Exports are inline because tmux's
/// session environment only reaches panes created afterwards.
pub fn build_startup_command(role: AgentRole, opts: &StartOptions, default_command: &str) -> String {
    let exports: Vec<String> = identity_env(role, opts)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, shell_quote(&v)))
        .collect();

    let mut parts = vec![opts.command.clone().unwrap_or_else(|| default_command.to_string())];
    parts.extend(opts.args.iter().map(|a| shell_quote(a)));

    format!("export {} && {}", exports.join(" "), parts.join(" "))
}

fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn is_shell(command: &str) -> bool {
    let command = command.trim_start_matches('-');
    SHELLS.contains(&command)
}

/// Text to emit given the previous and current capture: the appended suffix
/// when the old capture is a prefix, nothing when unchanged, else everything.
pub fn extract_new_content<'a>(old: &str, new: &'a str) -> &'a str {
    if old.is_empty() {
        return new;
    }
    match new.strip_prefix(old) {
        Some(suffix) => suffix,
        None => new,
    }
}

/// Session reconstructed from a tmux session name we did not start.
fn discovered_session(session_id: &str) -> Option<AgentSession> {
    let parsed = parse_session_id(session_id)?;
    Some(AgentSession {
        session_id: session_id.to_string(),
        agent_id: String::new(),
        role: parsed.role,
        team: parsed.team,
        worker: parsed.worker,
        running: true,
        started_at: Utc::now(),
        runtime_type: RUNTIME_TYPE.to_string(),
    })
}

#[async_trait]
impl AgentRuntime for TmuxRuntime {
    fn name(&self) -> &'static str {
        RUNTIME_TYPE
    }

    async fn start(&self, opts: StartOptions) -> Result<AgentSession> {
        let role = opts.require_role()?;
        let session_id = generate_session_id(role, opts.team.as_deref(), opts.worker.as_deref())?;

        if self.driver.has_session(&session_id).await? {
            return Err(GasTownError::SessionAlreadyExists(session_id));
        }

        self.driver
            .new_session(&session_id, opts.work_dir.as_deref())
            .await?;
        self.set_environment(&session_id, role, &opts).await;
        self.apply_theme(&session_id, role, &opts).await;

        let command = build_startup_command(role, &opts, &self.config.command);
        let launched = async {
            self.driver.send_keys(&session_id, &command).await?;
            self.driver.send_raw_key(&session_id, "Enter").await
        }
        .await;
        if let Err(e) = launched {
            let _ = self.driver.kill_session(&session_id).await;
            return Err(e);
        }

        if opts.wait_for_ready {
            let timeout = opts.ready_timeout.unwrap_or_else(|| self.config.ready_timeout());
            self.wait_for_ready(&session_id, timeout).await;
            self.dismiss_bypass_dialog(&session_id).await;
        }

        if let Some(prompt) = &opts.initial_prompt {
            tokio::time::sleep(self.delays.settle).await;
            if let Err(e) = self.nudge(&session_id, prompt).await {
                warn!(session = %session_id, error = %e, "Failed to deliver initial prompt");
            }
        }

        let session = AgentSession {
            session_id: session_id.clone(),
            agent_id: opts.agent_id.clone(),
            role,
            team: opts.team.clone(),
            worker: opts.worker.clone(),
            running: true,
            started_at: Utc::now(),
            runtime_type: RUNTIME_TYPE.to_string(),
        };

        self.sessions.write().unwrap_or_else(|e| e.into_inner()).insert(
            session_id.clone(),
            TrackedSession {
                session: session.clone(),
                last_prompt: opts.initial_prompt.clone(),
            },
        );

        info!(session = %session_id, role = %role, "Started tmux session");
        Ok(session)
    }

    async fn stop(&self, session_id: &str, force: bool) -> Result<()> {
        if !self.driver.has_session(session_id).await? {
            self.untrack(session_id);
            return Ok(());
        }

        if !force {
            let _ = self.driver.send_raw_key(session_id, "C-c").await;
            tokio::time::sleep(self.delays.interrupt_grace).await;
        }

        self.driver.kill_session(session_id).await?;
        self.untrack(session_id);
        info!(session = %session_id, force, "Stopped tmux session");
        Ok(())
    }

    async fn restart(&self, session_id: &str, opts: StartOptions) -> Result<AgentSession> {
        self.stop(session_id, false).await?;
        tokio::time::sleep(self.delays.restart_pause).await;
        self.start(opts).await
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        self.require_session(session_id).await?;
        self.nudge(session_id, prompt).await?;

        if let Some(tracked) = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(session_id)
        {
            tracked.last_prompt = Some(prompt.to_string());
        }
        Ok(())
    }

    async fn stream_responses(&self, session_id: &str) -> Result<ResponseStream> {
        self.require_session(session_id).await?;

        let (tx, rx) = mpsc::channel(100);
        let driver = Arc::clone(&self.driver);
        let name = session_id.to_string();
        let lines = self.config.capture_lines;
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::spawn(async move {
            let mut last = String::new();
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                match driver.capture_pane(&name, lines).await {
                    Ok(current) => {
                        if current == last {
                            continue;
                        }
                        let fresh = extract_new_content(&last, &current);
                        if !fresh.is_empty() && tx.send(Response::text(fresh)).await.is_err() {
                            break;
                        }
                        last = current;
                    }
                    Err(e) => {
                        let _ = tx.send(Response::error(e.to_string())).await;
                        break;
                    }
                }
            }
            debug!(session = %name, "Pane stream ended");
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn is_running(&self, session_id: &str) -> bool {
        self.driver.has_session(session_id).await.unwrap_or(false)
    }

    async fn get_status(&self, session_id: &str) -> Result<AgentStatus> {
        let alive = self.driver.has_session(session_id).await?;
        let tracked = self.tracked(session_id);

        match (alive, tracked) {
            (false, None) => Ok(AgentStatus::unknown(session_id, RUNTIME_TYPE)),
            (false, Some(tracked)) => {
                let mut session = tracked.session;
                session.running = false;
                let mut activity = ActivityInfo::since(session.started_at);
                activity.last_prompt = tracked.last_prompt;
                Ok(AgentStatus {
                    session,
                    health: HealthState::Unhealthy,
                    activity,
                    tmux: None,
                    process: None,
                })
            }
            (true, tracked) => {
                let session = tracked
                    .map(|t| t.session)
                    .or_else(|| discovered_session(session_id))
                    .unwrap_or_else(|| AgentStatus::unknown(session_id, RUNTIME_TYPE).session);
                Ok(self.session_status(session_id, session).await)
            }
        }
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<AgentSession>> {
        let names = self.driver.list_sessions().await?;
        let alive: HashSet<&str> = names.iter().map(String::as_str).collect();

        let tracked = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.retain(|id, _| alive.contains(id.as_str()));
            sessions.clone()
        };

        let mut result: Vec<AgentSession> = names
            .iter()
            .filter_map(|name| match tracked.get(name) {
                Some(t) => Some(t.session.clone()),
                None => discovered_session(name),
            })
            .filter(|s| filter.matches(s))
            .collect();
        result.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(result)
    }

    async fn capture_output(&self, session_id: &str, lines: usize) -> Result<String> {
        self.require_session(session_id).await?;
        self.driver.capture_pane(session_id, lines).await
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            streaming: false,
            tool_calls: false,
            system_prompt: false,
            attach: true,
            capture: true,
            max_concurrency: 0,
        }
    }

    async fn close(&self) -> Result<()> {
        // The tmux server outlives us; sessions keep running.
        Ok(())
    }
}
