//! Process-backed runtime.
//!
//! Sessions live inside this process. With an API key configured each
//! session is a conversation driven directly against the Messages API,
//! including tool calls. Without one, each session is a headless agent CLI
//! subprocess speaking newline-delimited JSON on stdout.
//!
//! Admission is bounded by a semaphore: a session holds one permit from a
//! successful `start` until it is stopped or its task ends on its own.

pub mod anthropic;
pub mod session;

pub use anthropic::{AnthropicClient, ModelClient};

use self::session::{ApiContext, SessionHandle, SessionTable, PROMPT_QUEUE};
use super::session_id::generate_session_id;
use super::tools::{ToolHandler, ToolRegistry};
use super::types::*;
use super::{AgentRuntime, ResponseStream};
use crate::config::ProcessConfig;
use crate::{GasTownError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

const RUNTIME_TYPE: &str = "process";

enum Mode {
    Api(Arc<dyn ModelClient>),
    Cli,
}

pub struct ProcessRuntime {
    config: ProcessConfig,
    mode: Mode,
    ceiling: usize,
    slots: Arc<Semaphore>,
    sessions: SessionTable,
    tools: Arc<ToolRegistry>,
}

impl ProcessRuntime {
    /// Direct-API mode when `api_key` is set, subprocess mode otherwise.
    pub fn new(config: ProcessConfig) -> Result<Self> {
        let mode = match config.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Mode::Api(Arc::new(AnthropicClient::new(&config, key)?)),
            None => Mode::Cli,
        };
        Ok(Self::with_mode(config, mode))
    }

    /// Direct-API mode against any model client.
    pub fn with_client(config: ProcessConfig, client: Arc<dyn ModelClient>) -> Self {
        Self::with_mode(config, Mode::Api(client))
    }

    fn with_mode(config: ProcessConfig, mode: Mode) -> Self {
        let ceiling = config.ceiling();
        Self {
            config,
            mode,
            ceiling,
            slots: Arc::new(Semaphore::new(ceiling)),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tools: Arc::new(ToolRegistry::new()),
        }
    }

    pub fn mode_name(&self) -> &'static str {
        match self.mode {
            Mode::Api(_) => "api",
            Mode::Cli => "cli",
        }
    }

    pub fn register_tool(&self, config: ToolConfig, handler: Arc<dyn ToolHandler>) {
        self.tools.register(config, Some(handler));
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.tools.unregister(name)
    }

    pub fn list_tools(&self) -> Vec<ToolConfig> {
        self.tools.list()
    }

    /// Admission slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn handle(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    fn require(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.handle(session_id)
            .ok_or_else(|| GasTownError::SessionNotFound(session_id.to_string()))
    }

    fn spawn_cli(
        &self,
        role: AgentRole,
        opts: &StartOptions,
        system_prompt: &str,
    ) -> Result<(Child, ChildStdin, ChildStdout)> {
        let mut cmd = Command::new(&self.config.cli_binary);
        cmd.args(&self.config.cli_args);
        if let Some(flag) = &self.config.cli_system_prompt_flag {
            if !system_prompt.is_empty() {
                cmd.arg(flag).arg(system_prompt);
            }
        }
        if let Some(dir) = &opts.work_dir {
            cmd.current_dir(dir);
        }
        cmd.env("GT_ROLE", role.as_str());
        if let Some(team) = &opts.team {
            cmd.env("GT_RIG", team);
        }
        cmd.envs(&opts.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GasTownError::BackendUnavailable(format!("{} not found", self.config.cli_binary))
            } else {
                GasTownError::Io(e)
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok((child, stdin, stdout)),
            _ => Err(GasTownError::BackendUnavailable(
                "CLI started without piped stdio".to_string(),
            )),
        }
    }
}

/// Prompt used when `start` supplies none.
pub fn default_system_prompt(role: AgentRole, team: Option<&str>, worker: Option<&str>) -> String {
    let team = team.unwrap_or_default();
    let worker = worker.unwrap_or_default();
    match role {
        AgentRole::Mayor => "You are the Mayor, the town coordinator for Gas Town. You manage rigs, \
             coordinate work assignments, and oversee the deacon and witnesses."
            .to_string(),
        AgentRole::Deacon => "You are the Deacon, the health monitor for Gas Town. You check on \
             agents, detect stuck workers, and keep the town running."
            .to_string(),
        AgentRole::Witness => format!(
            "You are the Witness for rig {}. You monitor polecats, spawn workers for incoming \
             issues, and report status.",
            team
        ),
        AgentRole::Refinery => format!(
            "You are the Refinery for rig {}. You process the merge queue, resolve conflicts, \
             and get code merged cleanly.",
            team
        ),
        AgentRole::Crew => format!(
            "You are crew member {} working on rig {}. You are a human-supervised worker with \
             full access to the codebase.",
            worker, team
        ),
        AgentRole::Polecat => format!(
            "You are polecat {} working on rig {}. You are an autonomous worker that handles \
             issues and creates pull requests.",
            worker, team
        ),
    }
}

#[async_trait]
impl AgentRuntime for ProcessRuntime {
    fn name(&self) -> &'static str {
        RUNTIME_TYPE
    }

    async fn start(&self, opts: StartOptions) -> Result<AgentSession> {
        let role = opts.require_role()?;
        let session_id = generate_session_id(role, opts.team.as_deref(), opts.worker.as_deref())?;

        if self.handle(&session_id).is_some() {
            return Err(GasTownError::SessionAlreadyExists(session_id));
        }

        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| GasTownError::CapacityExceeded(self.ceiling))?;

        for tool in &opts.tools {
            self.tools.declare(tool.clone());
        }

        let system_prompt = opts
            .system_prompt
            .clone()
            .unwrap_or_else(|| default_system_prompt(role, opts.team.as_deref(), opts.worker.as_deref()));

        // Spawn before publishing the session so a failed launch only has
        // to drop the permit.
        let child = match self.mode {
            Mode::Cli => Some(self.spawn_cli(role, &opts, &system_prompt)?),
            Mode::Api(_) => None,
        };

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

        let (tx, rx) = mpsc::channel(PROMPT_QUEUE);
        let handle = Arc::new(SessionHandle::new(session.clone(), tx, permit));

        {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if sessions.contains_key(&session_id) {
                return Err(GasTownError::SessionAlreadyExists(session_id));
            }
            sessions.insert(session_id.clone(), Arc::clone(&handle));
        }

        let table = Arc::clone(&self.sessions);
        let task = match (&self.mode, child) {
            (Mode::Api(client), _) => {
                let ctx = ApiContext {
                    client: Arc::clone(client),
                    tools: Arc::clone(&self.tools),
                    model: self.config.model.clone(),
                    max_tokens: self.config.max_tokens,
                    max_tool_turns: self.config.max_tool_turns.max(1),
                    system_prompt,
                };
                tokio::spawn(session::run_api(Arc::clone(&handle), rx, ctx, table))
            }
            (Mode::Cli, Some((child, stdin, stdout))) => tokio::spawn(session::run_cli(
                Arc::clone(&handle),
                rx,
                child,
                stdin,
                stdout,
                table,
            )),
            (Mode::Cli, None) => {
                handle.finish(&self.sessions);
                return Err(GasTownError::BackendUnavailable("CLI was not spawned".to_string()));
            }
        };
        handle.set_task(task);

        if let Some(prompt) = &opts.initial_prompt {
            self.send_prompt(&session_id, prompt).await?;
        }

        info!(session = %session_id, mode = self.mode_name(), "Started process session");
        Ok(session)
    }

    async fn stop(&self, session_id: &str, force: bool) -> Result<()> {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        let Some(handle) = removed else {
            return Ok(());
        };

        let task = handle.take_task();
        if force {
            handle.cancel.cancel();
        } else {
            handle.close_prompts();
        }

        if let Some(mut task) = task {
            if force {
                let _ = task.await;
            } else if tokio::time::timeout(self.config.stop_grace(), &mut task).await.is_err() {
                warn!(session = %session_id, "Graceful stop timed out, cancelling");
                handle.cancel.cancel();
                let _ = task.await;
            }
        }

        handle.finish(&self.sessions);
        info!(session = %session_id, force, "Stopped process session");
        Ok(())
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()> {
        let handle = self.require(session_id)?;
        let sender = handle
            .prompt_sender()
            .ok_or_else(|| GasTownError::SessionNotFound(session_id.to_string()))?;
        sender
            .send(prompt.to_string())
            .await
            .map_err(|_| GasTownError::SessionNotFound(session_id.to_string()))
    }

    async fn stream_responses(&self, session_id: &str) -> Result<ResponseStream> {
        Ok(self.require(session_id)?.broadcaster.subscribe())
    }

    async fn is_running(&self, session_id: &str) -> bool {
        self.handle(session_id).is_some_and(|h| !h.is_finished())
    }

    async fn get_status(&self, session_id: &str) -> Result<AgentStatus> {
        let Some(handle) = self.handle(session_id) else {
            return Ok(AgentStatus::unknown(session_id, RUNTIME_TYPE));
        };

        let running = !handle.is_finished();
        let mut session = handle.session.clone();
        session.running = running;

        let stats = handle.stats();
        let last = stats
            .last_response_at
            .or(stats.last_prompt_at)
            .unwrap_or(session.started_at);
        let mut activity = ActivityInfo::since(last);
        activity.last_prompt = stats.last_prompt.clone();
        activity.last_response = stats.last_response.clone();

        Ok(AgentStatus {
            health: if running { HealthState::Healthy } else { HealthState::Unhealthy },
            activity,
            tmux: None,
            process: Some(ProcessStatus {
                conversation_id: session.session_id.clone(),
                tokens_used: stats.tokens_used,
                turn_count: stats.turn_count,
            }),
            session,
        })
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<AgentSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<AgentSession> = sessions
            .values()
            .map(|h| h.session.clone())
            .filter(|s| filter.matches(s))
            .collect();
        result.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(result)
    }

    async fn capture_output(&self, session_id: &str, lines: usize) -> Result<String> {
        let handle = self.require(session_id)?;
        let stats = handle.stats();
        Ok(session::transcript(&stats.history, lines))
    }

    fn capabilities(&self) -> RuntimeCapabilities {
        RuntimeCapabilities {
            streaming: true,
            tool_calls: true,
            system_prompt: true,
            attach: false,
            capture: true,
            max_concurrency: self.ceiling,
        }
    }

    async fn close(&self) -> Result<()> {
        let ids: Vec<String> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.stop(&id, true).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::anthropic::{ContentBlock, ModelRequest, ModelResponse, Role, Usage};
    use super::*;
    use crate::runtime::tools::FnHandler;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Replays canned responses; answers "ok" once the script runs out.
    #[derive(Default)]
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<ModelResponse>>>,
        requests: Mutex<Vec<ModelRequest>>,
        repeat_tool_use: bool,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<ModelResponse>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(&self, request: &ModelRequest, _cancel: &CancellationToken) -> Result<ModelResponse> {
            self.requests.lock().unwrap().push(request.clone());
            if self.repeat_tool_use {
                return Ok(tool_use("tu", "echo", json!({"text": "again"})));
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(text_reply("ok")))
        }
    }

    fn text_reply(text: &str) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::Text { text: text.to_string() }],
            stop_reason: Some("end_turn".to_string()),
            usage: Usage { input_tokens: 10, output_tokens: 5 },
        }
    }

    fn tool_use(id: &str, name: &str, input: Value) -> ModelResponse {
        ModelResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            stop_reason: Some("tool_use".to_string()),
            usage: Usage::default(),
        }
    }

    fn config(ceiling: usize) -> ProcessConfig {
        ProcessConfig {
            max_concurrent_sessions: ceiling,
            stop_grace_secs: 1,
            ..Default::default()
        }
    }

    fn cat_config(binary: &str) -> ProcessConfig {
        ProcessConfig {
            cli_binary: binary.to_string(),
            cli_args: vec![],
            cli_system_prompt_flag: None,
            max_concurrent_sessions: 2,
            stop_grace_secs: 2,
            ..Default::default()
        }
    }

    fn worker(name: &str) -> StartOptions {
        StartOptions::new(format!("r1/{}", name), AgentRole::Polecat)
            .team("r1")
            .worker(name)
    }

    fn echo_tool() -> (ToolConfig, Arc<dyn ToolHandler>) {
        let config = ToolConfig {
            name: "echo".to_string(),
            description: "Echo the text field".to_string(),
            input_schema: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
        };
        let handler: Arc<dyn ToolHandler> = Arc::new(FnHandler(|input: Value| async move {
            Ok::<_, String>(input["text"].as_str().unwrap_or_default().to_string())
        }));
        (config, handler)
    }

    /// Collect responses until (and including) the first Complete.
    async fn until_complete(stream: &mut ResponseStream) -> Vec<ResponseKind> {
        let mut kinds = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .expect("timed out waiting for response");
            let Some(response) = next else { break };
            let done = response.kind == ResponseKind::Complete;
            kinds.push(response.kind);
            if done {
                break;
            }
        }
        kinds
    }

    async fn wait_until_gone(rt: &ProcessRuntime, id: &str) {
        for _ in 0..200 {
            if rt.handle(id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never ended", id);
    }

    #[tokio::test]
    async fn test_prompt_streams_text_then_complete() {
        let client = ScriptedClient::new(vec![Ok(text_reply("hi there"))]);
        let rt = ProcessRuntime::with_client(config(10), client.clone());

        let session = rt.start(worker("w1")).await.unwrap();
        assert_eq!(session.session_id, "gt-r1-w1");

        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "hello").await.unwrap();

        let kinds = until_complete(&mut stream).await;
        assert_eq!(
            kinds,
            vec![ResponseKind::Text("hi there".to_string()), ResponseKind::Complete]
        );

        let status = rt.get_status("gt-r1-w1").await.unwrap();
        assert_eq!(status.health, HealthState::Healthy);
        let process = status.process.unwrap();
        assert_eq!(process.tokens_used, 15);
        assert_eq!(process.turn_count, 1);
        assert_eq!(status.activity.last_prompt.as_deref(), Some("hello"));
        assert_eq!(status.activity.last_response.as_deref(), Some("hi there"));

        let request = &client.requests.lock().unwrap()[0];
        assert!(request.system.as_deref().unwrap().contains("polecat w1"));
    }

    #[tokio::test]
    async fn test_tool_call_is_executed_and_fed_back() {
        let client = ScriptedClient::new(vec![
            Ok(tool_use("tu_1", "echo", json!({"text": "ping"}))),
            Ok(text_reply("got ping")),
        ]);
        let rt = ProcessRuntime::with_client(config(10), client.clone());
        let (tool, handler) = echo_tool();
        rt.register_tool(tool, handler);

        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "use the tool").await.unwrap();

        let kinds = until_complete(&mut stream).await;
        assert_eq!(kinds.len(), 4);
        assert!(matches!(&kinds[0], ResponseKind::ToolCall(c) if c.name == "echo"));
        assert_eq!(kinds[1], ResponseKind::ToolResult(ToolResult::ok("tu_1", "ping")));
        assert_eq!(kinds[2], ResponseKind::Text("got ping".to_string()));

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(
            last.content,
            vec![ContentBlock::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: "ping".to_string(),
                is_error: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_error_result() {
        let client = ScriptedClient::new(vec![Ok(tool_use("tu_1", "nope", json!({})))]);
        let rt = ProcessRuntime::with_client(config(10), client);
        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "go").await.unwrap();

        let kinds = until_complete(&mut stream).await;
        assert_eq!(
            kinds[1],
            ResponseKind::ToolResult(ToolResult::err("tu_1", "unknown tool: nope"))
        );
    }

    #[tokio::test]
    async fn test_tool_loop_is_bounded() {
        let client = Arc::new(ScriptedClient {
            repeat_tool_use: true,
            ..Default::default()
        });
        let cfg = ProcessConfig { max_tool_turns: 3, ..config(10) };
        let rt = ProcessRuntime::with_client(cfg, client.clone());
        let (tool, handler) = echo_tool();
        rt.register_tool(tool, handler);

        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "loop").await.unwrap();

        let kinds = until_complete(&mut stream).await;
        assert!(matches!(kinds[kinds.len() - 2], ResponseKind::Error(_)));
        assert_eq!(client.requests.lock().unwrap().len(), 3);
        assert!(rt.is_running("gt-r1-w1").await);
    }

    #[tokio::test]
    async fn test_truncated_tool_use_still_gets_result() {
        let mut truncated = tool_use("tu_1", "echo", json!({"text": "cut"}));
        truncated.stop_reason = Some("max_tokens".to_string());
        let client = ScriptedClient::new(vec![Ok(truncated)]);
        let rt = ProcessRuntime::with_client(config(10), client.clone());
        let (tool, handler) = echo_tool();
        rt.register_tool(tool, handler);

        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "first").await.unwrap();
        let kinds = until_complete(&mut stream).await;
        assert_eq!(kinds.last(), Some(&ResponseKind::Complete));

        rt.send_prompt("gt-r1-w1", "second").await.unwrap();
        until_complete(&mut stream).await;

        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let messages = &requests[1].messages;
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User]);
        assert!(matches!(messages[1].content[0], ContentBlock::ToolUse { .. }));
        assert_eq!(
            messages[2].content,
            vec![
                ContentBlock::ToolResult {
                    tool_use_id: "tu_1".to_string(),
                    content: "cut".to_string(),
                    is_error: false,
                },
                ContentBlock::Text { text: "second".to_string() },
            ]
        );
    }

    #[tokio::test]
    async fn test_force_stop_with_unread_stream() {
        let client = Arc::new(ScriptedClient {
            repeat_tool_use: true,
            ..Default::default()
        });
        let cfg = ProcessConfig { max_tool_turns: 200, ..config(2) };
        let rt = ProcessRuntime::with_client(cfg, client.clone());
        let (tool, handler) = echo_tool();
        rt.register_tool(tool, handler);

        rt.start(worker("w1")).await.unwrap();
        let _unread = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "loop").await.unwrap();

        // Two events per model call; the queue fills after about 50 calls
        for _ in 0..300 {
            if client.requests.lock().unwrap().len() > 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::timeout(Duration::from_secs(3), rt.stop("gt-r1-w1", true))
            .await
            .expect("force stop hung on a stalled subscriber")
            .unwrap();
        assert!(!rt.is_running("gt-r1-w1").await);
        assert_eq!(rt.available_slots(), 2);
        assert!(client.requests.lock().unwrap().len() < 200);
    }

    #[tokio::test]
    async fn test_close_with_unread_stream() {
        let client = Arc::new(ScriptedClient {
            repeat_tool_use: true,
            ..Default::default()
        });
        let cfg = ProcessConfig { max_tool_turns: 200, ..config(2) };
        let rt = ProcessRuntime::with_client(cfg, client.clone());
        let (tool, handler) = echo_tool();
        rt.register_tool(tool, handler);

        rt.start(worker("w1")).await.unwrap();
        let _unread = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "loop").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(5), rt.close())
            .await
            .expect("close hung on a stalled subscriber")
            .unwrap();
        assert_eq!(rt.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_model_error_keeps_session_alive() {
        let client = ScriptedClient::new(vec![Err(GasTownError::Upstream("overloaded".to_string()))]);
        let rt = ProcessRuntime::with_client(config(10), client);
        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();

        rt.send_prompt("gt-r1-w1", "first").await.unwrap();
        let first = stream.next().await.unwrap();
        assert!(matches!(first.kind, ResponseKind::Error(ref m) if m.contains("overloaded")));

        rt.send_prompt("gt-r1-w1", "second").await.unwrap();
        let kinds = until_complete(&mut stream).await;
        assert_eq!(kinds, vec![ResponseKind::Text("ok".to_string()), ResponseKind::Complete]);
    }

    #[tokio::test]
    async fn test_ceiling_rejects_then_recovers() {
        let rt = ProcessRuntime::with_client(config(2), ScriptedClient::new(vec![]));
        rt.start(worker("a")).await.unwrap();
        rt.start(worker("b")).await.unwrap();

        let err = rt.start(worker("c")).await.unwrap_err();
        assert!(matches!(err, GasTownError::CapacityExceeded(2)));

        rt.stop("gt-r1-a", false).await.unwrap();
        rt.start(worker("c")).await.unwrap();
        assert_eq!(rt.available_slots(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_start_does_not_leak_slot() {
        let rt = ProcessRuntime::with_client(config(2), ScriptedClient::new(vec![]));
        rt.start(worker("a")).await.unwrap();
        assert!(matches!(
            rt.start(worker("a")).await,
            Err(GasTownError::SessionAlreadyExists(_))
        ));

        // Exactly one slot must be left
        rt.start(worker("b")).await.unwrap();
        assert!(matches!(
            rt.start(worker("c")).await,
            Err(GasTownError::CapacityExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let rt = ProcessRuntime::with_client(config(2), ScriptedClient::new(vec![]));
        rt.stop("gt-r1-ghost", false).await.unwrap();
        rt.stop("gt-r1-ghost", true).await.unwrap();

        let status = rt.get_status("gt-r1-ghost").await.unwrap();
        assert!(!status.session.running);
        assert_eq!(status.health, HealthState::Unknown);

        assert!(matches!(
            rt.send_prompt("gt-r1-ghost", "hi").await,
            Err(GasTownError::SessionNotFound(_))
        ));
        assert!(matches!(
            rt.stream_responses("gt-r1-ghost").await,
            Err(GasTownError::SessionNotFound(_))
        ));
        assert!(matches!(
            rt.capture_output("gt-r1-ghost", 10).await,
            Err(GasTownError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_stop_removes_session() {
        let rt = ProcessRuntime::with_client(config(2), ScriptedClient::new(vec![]));
        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();

        rt.stop("gt-r1-w1", false).await.unwrap();
        assert!(rt.list_sessions(&SessionFilter::default()).await.unwrap().is_empty());
        assert!(!rt.get_status("gt-r1-w1").await.unwrap().session.running);
        assert_eq!(rt.available_slots(), 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_list_filter_and_capture() {
        let rt = ProcessRuntime::with_client(config(5), ScriptedClient::new(vec![Ok(text_reply("pong"))]));
        rt.start(worker("w1")).await.unwrap();
        rt.start(StartOptions::new("m", AgentRole::Mayor)).await.unwrap();

        let polecats = SessionFilter { role: Some(AgentRole::Polecat), ..Default::default() };
        let listed = rt.list_sessions(&polecats).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "gt-r1-w1");

        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();
        rt.send_prompt("gt-r1-w1", "ping").await.unwrap();
        until_complete(&mut stream).await;
        assert_eq!(
            rt.capture_output("gt-r1-w1", 50).await.unwrap(),
            "[user]\nping\n\n[assistant]\npong\n\n"
        );

        rt.close().await.unwrap();
        assert!(rt.list_sessions(&SessionFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tools_declared_at_start() {
        let rt = ProcessRuntime::with_client(config(2), ScriptedClient::new(vec![]));
        let mut opts = worker("w1");
        opts.tools.push(ToolConfig {
            name: "grep".to_string(),
            description: String::new(),
            input_schema: json!({"type": "object"}),
        });
        rt.start(opts).await.unwrap();
        assert_eq!(rt.list_tools()[0].name, "grep");
        assert!(rt.unregister_tool("grep"));
        assert!(rt.list_tools().is_empty());
    }

    #[tokio::test]
    async fn test_cli_mode_echoes_through_subprocess() {
        let rt = ProcessRuntime::new(cat_config("cat")).unwrap();
        assert_eq!(rt.mode_name(), "cli");

        rt.start(worker("w1")).await.unwrap();
        let mut stream = rt.stream_responses("gt-r1-w1").await.unwrap();

        rt.send_prompt("gt-r1-w1", "plain words").await.unwrap();
        rt.send_prompt("gt-r1-w1", r#"{"type":"text","content":"structured"}"#)
            .await
            .unwrap();
        rt.send_prompt("gt-r1-w1", r#"{"type":"result"}"#).await.unwrap();

        let kinds = until_complete(&mut stream).await;
        assert_eq!(
            kinds,
            vec![
                ResponseKind::Text("plain words".to_string()),
                ResponseKind::Text("structured".to_string()),
                ResponseKind::Complete,
            ]
        );
        assert_eq!(rt.get_status("gt-r1-w1").await.unwrap().process.unwrap().turn_count, 3);

        rt.stop("gt-r1-w1", false).await.unwrap();
        assert_eq!(rt.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_cli_missing_binary_releases_slot() {
        let rt = ProcessRuntime::new(cat_config("gastown-no-such-cli")).unwrap();
        let err = rt.start(worker("w1")).await.unwrap_err();
        assert!(matches!(err, GasTownError::BackendUnavailable(_)));
        assert_eq!(rt.available_slots(), 2);
        assert!(!rt.is_running("gt-r1-w1").await);
    }

    #[tokio::test]
    async fn test_cli_exit_ends_session() {
        let rt = ProcessRuntime::new(cat_config("true")).unwrap();
        rt.start(worker("w1")).await.unwrap();

        wait_until_gone(&rt, "gt-r1-w1").await;
        assert_eq!(rt.available_slots(), 2);
        assert_eq!(
            rt.get_status("gt-r1-w1").await.unwrap().health,
            HealthState::Unknown
        );
    }

    #[tokio::test]
    async fn test_force_stop_kills_subprocess() {
        let rt = ProcessRuntime::new(cat_config("cat")).unwrap();
        rt.start(worker("w1")).await.unwrap();
        rt.stop("gt-r1-w1", true).await.unwrap();
        assert!(!rt.is_running("gt-r1-w1").await);
        assert_eq!(rt.available_slots(), 2);
    }

    #[test]
    fn test_default_system_prompts_mention_identity() {
        let prompt = default_system_prompt(AgentRole::Crew, Some("r1"), Some("joe"));
        assert!(prompt.contains("crew member joe"));
        assert!(prompt.contains("rig r1"));
        assert!(default_system_prompt(AgentRole::Mayor, None, None).contains("Mayor"));
    }
}
