//! Request and response bodies for the gateway.

use crate::runtime::{
    generate_session_id, AgentRole, Response, ResponseKind, SessionFilter, StartOptions, ToolConfig,
};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OUTPUT_LINES: usize = 50;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    /// Defaults to the computed session id
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, alias = "rig", alias = "rig_name")]
    pub team: Option<String>,
    #[serde(default, alias = "worker_name")]
    pub worker: Option<String>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub initial_prompt: Option<String>,
    #[serde(default)]
    pub wait_for_ready: bool,
    #[serde(default)]
    pub ready_timeout_secs: Option<u64>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl CreateSessionRequest {
    pub fn into_options(self) -> Result<StartOptions> {
        let role = match non_empty(self.role) {
            Some(role) => Some(role.parse::<AgentRole>()?),
            None => None,
        };
        let team = non_empty(self.team);
        let worker = non_empty(self.worker);

        let agent_id = match (non_empty(self.agent_id), role) {
            (Some(id), _) => id,
            (None, Some(role)) => generate_session_id(role, team.as_deref(), worker.as_deref())?,
            (None, None) => String::new(),
        };

        Ok(StartOptions {
            agent_id,
            role,
            team,
            worker,
            work_dir: self.work_dir,
            environment: self.environment,
            system_prompt: non_empty(self.system_prompt),
            tools: self.tools,
            initial_prompt: non_empty(self.initial_prompt),
            wait_for_ready: self.wait_for_ready,
            ready_timeout: self.ready_timeout_secs.map(Duration::from_secs),
            account: self.account,
            config_dir: self.config_dir,
            command: self.command,
            args: self.args,
        })
    }
}

/// `GET /sessions` query. Empty values mean "no filter".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default, alias = "team")]
    pub rig: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl ListQuery {
    pub fn into_filter(self) -> Result<SessionFilter> {
        let role = match non_empty(self.role) {
            Some(role) => Some(role.parse::<AgentRole>()?),
            None => None,
        };
        Ok(SessionFilter {
            team: non_empty(self.rig),
            role,
            running: self.running,
            agent_id: non_empty(self.agent_id),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputResponse {
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub runtime: String,
}

/// Outbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// RFC 3339
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Response> for WsMessage {
    fn from(response: &Response) -> Self {
        let (content, error) = match &response.kind {
            ResponseKind::Text(text) => (Some(text.clone()), None),
            ResponseKind::ToolCall(call) => (serde_json::to_string(call).ok(), None),
            ResponseKind::ToolResult(result) => (serde_json::to_string(result).ok(), None),
            ResponseKind::Error(message) => (None, Some(message.clone())),
            ResponseKind::Complete => (Some("complete".to_string()), None),
        };
        Self {
            kind: response.type_name().to_string(),
            content,
            timestamp: response.timestamp.to_rfc3339(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ToolCall, ToolResult};
    use crate::GasTownError;
    use serde_json::json;

    #[test]
    fn test_create_request_accepts_rig_aliases() {
        let req: CreateSessionRequest = serde_json::from_value(json!({
            "role": "polecat",
            "rig_name": "r1",
            "worker_name": "w1"
        }))
        .unwrap();
        let opts = req.into_options().unwrap();
        assert_eq!(opts.role, Some(AgentRole::Polecat));
        assert_eq!(opts.team.as_deref(), Some("r1"));
        assert_eq!(opts.agent_id, "gt-r1-w1");
    }

    #[test]
    fn test_create_request_rejects_unknown_role() {
        let req = CreateSessionRequest {
            role: Some("sheriff".to_string()),
            ..Default::default()
        };
        assert!(matches!(req.into_options(), Err(GasTownError::InvalidRequest(_))));
    }

    #[test]
    fn test_missing_role_is_left_for_start() {
        let opts = CreateSessionRequest::default().into_options().unwrap();
        assert!(opts.role.is_none());
        assert!(opts.require_role().is_err());
    }

    #[test]
    fn test_list_query_blank_values_match_all() {
        let query = ListQuery {
            rig: Some(String::new()),
            role: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(query.into_filter().unwrap(), SessionFilter::default());
    }

    #[test]
    fn test_ws_message_shapes() {
        let complete = WsMessage::from(&Response::complete());
        assert_eq!(complete.kind, "complete");
        assert_eq!(complete.content.as_deref(), Some("complete"));

        let err = WsMessage::from(&Response::error("boom"));
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.content.is_none());

        let call = WsMessage::from(&Response::new(ResponseKind::ToolCall(ToolCall {
            id: "tu_1".to_string(),
            name: "grep".to_string(),
            input: json!({"pattern": "fn"}),
        })));
        assert_eq!(call.kind, "tool_call");
        let payload: serde_json::Value = serde_json::from_str(call.content.as_deref().unwrap()).unwrap();
        assert_eq!(payload["name"], "grep");

        let result = WsMessage::from(&Response::new(ResponseKind::ToolResult(ToolResult::ok("tu_1", "3"))));
        assert_eq!(result.kind, "tool_result");

        let value = serde_json::to_value(&complete).unwrap();
        assert!(value.get("error").is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }
}
