//! Agent runtime abstraction.
//!
//! One contract, two backends: [`TmuxRuntime`] drives agents living in tmux
//! sessions, [`ProcessRuntime`] hosts model conversations in-process (direct
//! API) or behind a headless CLI subprocess.

pub mod fanout;
pub mod process;
pub mod session_id;
pub mod tmux;
pub mod tools;
pub mod types;

pub use process::ProcessRuntime;
pub use session_id::{generate_session_id, parse_session_id, ParsedSessionId};
pub use tmux::TmuxRuntime;
pub use tools::{ToolHandler, ToolRegistry};
pub use types::*;

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// Stream of responses for one session. Ends when the session does, or when
/// the consumer drops it.
pub type ResponseStream = BoxStream<'static, Response>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Launch a worker. Fails if a live session with the same id exists.
    async fn start(&self, opts: StartOptions) -> Result<AgentSession>;

    /// Stop a session. Unknown ids are a no-op.
    async fn stop(&self, session_id: &str, force: bool) -> Result<()>;

    /// Graceful stop followed by a fresh start.
    async fn restart(&self, session_id: &str, opts: StartOptions) -> Result<AgentSession> {
        self.stop(session_id, false).await?;
        self.start(opts).await
    }

    async fn send_prompt(&self, session_id: &str, prompt: &str) -> Result<()>;

    async fn stream_responses(&self, session_id: &str) -> Result<ResponseStream>;

    async fn is_running(&self, session_id: &str) -> bool;

    /// Never fails for unknown ids; those report `HealthState::Unknown`.
    async fn get_status(&self, session_id: &str) -> Result<AgentStatus>;

    async fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<AgentSession>>;

    async fn get_activity(&self, session_id: &str) -> Result<ActivityInfo> {
        Ok(self.get_status(session_id).await?.activity)
    }

    async fn capture_output(&self, session_id: &str, lines: usize) -> Result<String>;

    fn capabilities(&self) -> RuntimeCapabilities;

    /// Release everything the runtime owns.
    async fn close(&self) -> Result<()>;
}
