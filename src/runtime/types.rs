//! Data shared by every runtime: sessions, options, responses, status.

use crate::{GasTownError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Idle longer than this is stale.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(60);
/// Idle longer than this is stuck.
pub const STUCK_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Worker role. Determines session naming and identity requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Town-level coordinator
    Mayor,
    /// Town-level background daemon agent
    Deacon,
    /// Per-team monitor (singleton)
    Witness,
    /// Per-team merge queue processor (singleton)
    Refinery,
    /// Primary worker
    Polecat,
    /// Human-supervised secondary worker
    Crew,
}

impl AgentRole {
    pub const ALL: [AgentRole; 6] = [
        AgentRole::Mayor,
        AgentRole::Deacon,
        AgentRole::Witness,
        AgentRole::Refinery,
        AgentRole::Polecat,
        AgentRole::Crew,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Mayor => "mayor",
            AgentRole::Deacon => "deacon",
            AgentRole::Witness => "witness",
            AgentRole::Refinery => "refinery",
            AgentRole::Polecat => "polecat",
            AgentRole::Crew => "crew",
        }
    }

    /// Town roles have no team.
    pub fn is_town(&self) -> bool {
        matches!(self, AgentRole::Mayor | AgentRole::Deacon)
    }

    /// Worker roles need both team and worker name.
    pub fn is_worker(&self) -> bool {
        matches!(self, AgentRole::Polecat | AgentRole::Crew)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = GasTownError;

    fn from_str(s: &str) -> Result<Self> {
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| GasTownError::InvalidRequest(format!("unknown role: {}", s)))
    }
}

/// A live (or last known) worker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub session_id: String,
    pub agent_id: String,
    pub role: AgentRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub runtime_type: String,
}

/// Declaration of a tool a session may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// Everything `start` needs to launch a worker.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub agent_id: String,
    pub role: Option<AgentRole>,
    pub team: Option<String>,
    pub worker: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub environment: HashMap<String, String>,
    pub system_prompt: Option<String>,
    pub tools: Vec<ToolConfig>,
    pub initial_prompt: Option<String>,
    pub wait_for_ready: bool,
    pub ready_timeout: Option<Duration>,
    /// Account handle exported to the agent (terminal runtime)
    pub account: Option<String>,
    /// Agent config directory exported to the agent (terminal runtime)
    pub config_dir: Option<PathBuf>,
    /// Overrides the configured agent command (terminal runtime)
    pub command: Option<String>,
    pub args: Vec<String>,
}

impl StartOptions {
    pub fn new(agent_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: Some(role),
            ..Default::default()
        }
    }

    pub fn team(mut self, team: impl Into<String>) -> Self {
        self.team = Some(team.into());
        self
    }

    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Resolve the role, or fail when it was omitted.
    pub fn require_role(&self) -> Result<AgentRole> {
        self.role
            .ok_or_else(|| GasTownError::InvalidRequest("role is required".to_string()))
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Outcome of a tool invocation. Exactly one of `output` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn err(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Payload of a stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Error(String),
    Complete,
}

/// One message on a session's response stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: ResponseKind,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn new(kind: ResponseKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(ResponseKind::Text(content.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ResponseKind::Error(message.into()))
    }

    pub fn complete() -> Self {
        Self::new(ResponseKind::Complete)
    }

    /// Wire name of the message type.
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ResponseKind::Text(_) => "text",
            ResponseKind::ToolCall(_) => "tool_call",
            ResponseKind::ToolResult(_) => "tool_result",
            ResponseKind::Error(_) => "error",
            ResponseKind::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    Active,
    Stale,
    Stuck,
}

impl ActivityState {
    pub fn from_idle(idle: Duration) -> Self {
        if idle > STUCK_THRESHOLD {
            ActivityState::Stuck
        } else if idle > STALE_THRESHOLD {
            ActivityState::Stale
        } else {
            ActivityState::Active
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub last_activity: DateTime<Utc>,
    /// Idle time in whole seconds
    #[serde(with = "duration_secs")]
    pub idle_duration: Duration,
    pub state: ActivityState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
}

impl ActivityInfo {
    /// Build from a last-activity timestamp, classifying against now.
    pub fn since(last_activity: DateTime<Utc>) -> Self {
        let idle = (Utc::now() - last_activity).to_std().unwrap_or_default();
        Self {
            last_activity,
            idle_duration: idle,
            state: ActivityState::from_idle(idle),
            last_prompt: None,
            last_response: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// tmux-specific status detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmuxStatus {
    pub session_name: String,
    pub pane_id: String,
    pub attached: bool,
    pub windows: u32,
    pub pane_command: String,
}

/// Process-runtime status detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub conversation_id: String,
    pub tokens_used: u64,
    pub turn_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub session: AgentSession,
    pub health: HealthState,
    pub activity: ActivityInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux: Option<TmuxStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessStatus>,
}

impl AgentStatus {
    /// Status for a session the runtime knows nothing about.
    ///
    /// Identity is recovered from the id where the grammar allows it.
    pub fn unknown(session_id: &str, runtime_type: &str) -> Self {
        let parsed = super::session_id::parse_session_id(session_id);
        let now = Utc::now();
        let session = AgentSession {
            session_id: session_id.to_string(),
            agent_id: String::new(),
            role: parsed.as_ref().map(|p| p.role).unwrap_or(AgentRole::Polecat),
            team: parsed.as_ref().and_then(|p| p.team.clone()),
            worker: parsed.and_then(|p| p.worker),
            running: false,
            started_at: now,
            runtime_type: runtime_type.to_string(),
        };

        Self {
            session,
            health: HealthState::Unknown,
            activity: ActivityInfo::since(now),
            tmux: None,
            process: None,
        }
    }
}

/// What a runtime can do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCapabilities {
    pub streaming: bool,
    pub tool_calls: bool,
    pub system_prompt: bool,
    pub attach: bool,
    pub capture: bool,
    /// 0 means unlimited
    pub max_concurrency: usize,
}

/// Criteria for `list_sessions`. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SessionFilter {
    pub team: Option<String>,
    pub role: Option<AgentRole>,
    pub running: Option<bool>,
    pub agent_id: Option<String>,
}

impl SessionFilter {
    pub fn matches(&self, session: &AgentSession) -> bool {
        if let Some(team) = &self.team {
            if session.team.as_deref() != Some(team.as_str()) {
                return false;
            }
        }
        if let Some(role) = self.role {
            if session.role != role {
                return false;
            }
        }
        if let Some(running) = self.running {
            if session.running != running {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &session.agent_id != agent_id {
                return false;
            }
        }
        true
    }
}
