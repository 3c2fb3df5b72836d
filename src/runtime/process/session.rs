//! Per-session state and the task that serves it.
//!
//! Each session owns one task. Prompts arrive on a bounded queue and are
//! handled strictly in order; responses go out through the session's
//! [`Broadcaster`]. The task ends when the prompt queue closes, the
//! subprocess exits, or the session's cancellation token fires.

use super::anthropic::{ContentBlock, Message, ModelClient, ModelRequest, Role};
use crate::runtime::fanout::Broadcaster;
use crate::runtime::tools::ToolRegistry;
use crate::runtime::types::*;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PROMPT_QUEUE: usize = 10;

pub(super) type SessionTable = Arc<RwLock<HashMap<String, Arc<SessionHandle>>>>;

/// Mutable bookkeeping read by status and capture.
#[derive(Debug, Default)]
pub(super) struct SessionStats {
    pub last_prompt: Option<String>,
    pub last_prompt_at: Option<DateTime<Utc>>,
    pub last_response: Option<String>,
    pub last_response_at: Option<DateTime<Utc>>,
    pub tokens_used: u64,
    pub turn_count: u64,
    pub history: Vec<Message>,
}

impl SessionStats {
    fn record_prompt(&mut self, prompt: &str) {
        self.last_prompt = Some(prompt.to_string());
        self.last_prompt_at = Some(Utc::now());
        self.turn_count += 1;
    }

    fn record_response(&mut self, text: Option<&str>) {
        if let Some(text) = text {
            self.last_response = Some(text.to_string());
        }
        self.last_response_at = Some(Utc::now());
    }
}

pub(super) struct SessionHandle {
    pub session: AgentSession,
    pub stats: Mutex<SessionStats>,
    pub broadcaster: Broadcaster,
    pub cancel: CancellationToken,
    prompts: Mutex<Option<mpsc::Sender<String>>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new(
        session: AgentSession,
        prompts: mpsc::Sender<String>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            session,
            stats: Mutex::new(SessionStats::default()),
            broadcaster: Broadcaster::new(),
            cancel: CancellationToken::new(),
            prompts: Mutex::new(Some(prompts)),
            permit: Mutex::new(Some(permit)),
            task: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> std::sync::MutexGuard<'_, SessionStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_task(&self, task: JoinHandle<()>) {
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn prompt_sender(&self) -> Option<mpsc::Sender<String>> {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Close the prompt queue; the task drains what is queued, then exits.
    pub fn close_prompts(&self) {
        self.prompts.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Give the admission slot back. Only the first call has any effect.
    pub fn release_slot(&self) -> bool {
        self.permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tear down after the task is gone: end streams, release the slot, and
    /// drop the table entry if it still refers to this session.
    pub fn finish(self: &Arc<Self>, table: &SessionTable) {
        self.cancel.cancel();
        self.close_prompts();
        self.broadcaster.close();
        if self.release_slot() {
            debug!(session = %self.session.session_id, "Released session slot");
        }

        let mut sessions = table.write().unwrap_or_else(|e| e.into_inner());
        let is_current = sessions
            .get(&self.session.session_id)
            .is_some_and(|current| Arc::ptr_eq(current, self));
        if is_current {
            sessions.remove(&self.session.session_id);
            info!(session = %self.session.session_id, "Session ended");
        }
    }

    /// Stops waiting on slow subscribers once the session is cancelled.
    async fn publish(&self, response: Response) {
        self.broadcaster.publish(response, &self.cancel).await;
    }
}

/// Everything the direct-API loop needs besides the session itself.
pub(super) struct ApiContext {
    pub client: Arc<dyn ModelClient>,
    pub tools: Arc<ToolRegistry>,
    pub model: String,
    pub max_tokens: u32,
    pub max_tool_turns: usize,
    pub system_prompt: String,
}

pub(super) async fn run_api(
    handle: Arc<SessionHandle>,
    mut prompts: mpsc::Receiver<String>,
    ctx: ApiContext,
    table: SessionTable,
) {
    loop {
        let prompt = tokio::select! {
            _ = handle.cancel.cancelled() => break,
            prompt = prompts.recv() => match prompt {
                Some(prompt) => prompt,
                None => break,
            },
        };
        handle_api_prompt(&handle, &ctx, &prompt).await;
    }
    handle.finish(&table);
}

async fn handle_api_prompt(handle: &SessionHandle, ctx: &ApiContext, prompt: &str) {
    {
        let mut stats = handle.stats();
        stats.record_prompt(prompt);
        // A trailing tool-result turn absorbs the prompt so roles keep alternating
        match stats.history.last_mut() {
            Some(last) if last.role == Role::User => last.content.push(ContentBlock::Text {
                text: prompt.to_string(),
            }),
            _ => stats.history.push(Message::user_text(prompt)),
        }
    }

    for call_index in 0.. {
        if handle.cancel.is_cancelled() {
            return;
        }
        if call_index >= ctx.max_tool_turns {
            warn!(session = %handle.session.session_id, "Tool loop hit {} model calls", ctx.max_tool_turns);
            handle
                .publish(Response::error(format!(
                    "tool loop exceeded {} model calls",
                    ctx.max_tool_turns
                )))
                .await;
            handle.publish(Response::complete()).await;
            return;
        }

        let request = ModelRequest {
            model: ctx.model.clone(),
            max_tokens: ctx.max_tokens,
            system: Some(ctx.system_prompt.clone()).filter(|s| !s.is_empty()),
            messages: handle.stats().history.clone(),
            tools: ctx.tools.list(),
        };

        let response = match ctx.client.complete(&request, &handle.cancel).await {
            Ok(response) => response,
            Err(e) => {
                if !handle.cancel.is_cancelled() {
                    handle.publish(Response::error(e.to_string())).await;
                }
                return;
            }
        };

        let content: Vec<ContentBlock> = response
            .content
            .iter()
            .filter(|b| !matches!(b, ContentBlock::Unknown))
            .cloned()
            .collect();
        let text: Vec<&str> = content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();

        {
            let mut stats = handle.stats();
            stats.tokens_used += response.usage.input_tokens + response.usage.output_tokens;
            if !content.is_empty() {
                stats.history.push(Message {
                    role: Role::Assistant,
                    content: content.clone(),
                });
            }
            let joined = text.join("");
            stats.record_response(Some(joined.as_str()).filter(|t| !t.is_empty()));
        }

        let mut results = Vec::new();
        for block in &content {
            match block {
                ContentBlock::Text { text } => handle.publish(Response::text(text.clone())).await,
                ContentBlock::ToolUse { id, name, input } => {
                    let call = ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    };
                    handle.publish(Response::new(ResponseKind::ToolCall(call.clone()))).await;

                    let result = ctx.tools.execute(&call, handle.cancel.child_token()).await;
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: result
                            .output
                            .clone()
                            .or_else(|| result.error.clone())
                            .unwrap_or_default(),
                        is_error: result.is_error(),
                    });
                    handle.publish(Response::new(ResponseKind::ToolResult(result))).await;
                }
                _ => {}
            }
        }

        // Every tool_use in history must be answered, whatever the stop reason
        let ran_tools = !results.is_empty();
        if ran_tools {
            handle.stats().history.push(Message {
                role: Role::User,
                content: results,
            });
        }

        if !response.wants_tools() || !ran_tools {
            handle.publish(Response::complete()).await;
            return;
        }
    }
}

/// Map one line of CLI output to a response. `None` for lines to skip.
pub fn parse_cli_line(line: &str) -> Option<Response> {
    let line = line.trim_end();
    if line.is_empty() {
        return None;
    }

    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Some(Response::text(line));
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Some(Response::text(line));
    };
    let str_field = |name: &str| value.get(name).and_then(Value::as_str).unwrap_or_default().to_string();

    match kind {
        "text" | "content" => Some(Response::text(str_field("content"))),
        "error" => Some(Response::error(str_field("error"))),
        "done" | "complete" | "result" => Some(Response::complete()),
        "assistant" => {
            let text: Vec<&str> = value
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if text.is_empty() {
                None
            } else {
                Some(Response::text(text.join("")))
            }
        }
        _ => None,
    }
}

pub(super) async fn run_cli(
    handle: Arc<SessionHandle>,
    mut prompts: mpsc::Receiver<String>,
    mut child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    table: SessionTable,
) {
    let mut stdin = Some(stdin);
    let mut lines = BufReader::new(stdout).lines();
    let mut accepting = true;

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                let _ = child.kill().await;
                break;
            }
            prompt = prompts.recv(), if accepting => match prompt {
                Some(prompt) => {
                    handle.stats().record_prompt(&prompt);
                    if let Some(writer) = stdin.as_mut() {
                        if let Err(e) = write_prompt(writer, &prompt).await {
                            handle.publish(Response::error(format!("failed to send prompt: {}", e))).await;
                        }
                    }
                }
                None => {
                    // Closing stdin lets the CLI finish and exit on its own
                    accepting = false;
                    stdin = None;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(response) = parse_cli_line(&line) {
                        let text = match &response.kind {
                            ResponseKind::Text(t) => Some(t.as_str()),
                            _ => None,
                        };
                        handle.stats().record_response(text);
                        handle.publish(response).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    handle.publish(Response::error(format!("reading CLI output: {}", e))).await;
                    break;
                }
            },
        }
    }

    drop(stdin);
    match child.wait().await {
        Ok(status) => debug!(session = %handle.session.session_id, %status, "CLI exited"),
        Err(e) => warn!(session = %handle.session.session_id, error = %e, "Failed to reap CLI"),
    }
    handle.finish(&table);
}

async fn write_prompt(stdin: &mut ChildStdin, prompt: &str) -> std::io::Result<()> {
    stdin.write_all(prompt.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Role-tagged transcript of the last `turns` messages.
pub(super) fn transcript(history: &[Message], turns: usize) -> String {
    let start = if turns > 0 { history.len().saturating_sub(turns) } else { 0 };
    let mut out = String::new();
    for message in &history[start..] {
        out.push_str(&format!("[{}]\n", message.role.as_str()));
        for block in &message.content {
            match block {
                ContentBlock::Text { text } => {
                    out.push_str(text);
                    out.push('\n');
                }
                ContentBlock::ToolUse { name, input, .. } => {
                    out.push_str(&format!("(tool call {} {})\n", name, input));
                }
                ContentBlock::ToolResult { content, is_error, .. } => {
                    let label = if *is_error { "tool error" } else { "tool result" };
                    out.push_str(&format!("({} {})\n", label, content));
                }
                ContentBlock::Unknown => {}
            }
        }
        out.push('\n');
    }
    out
}
