//! Gas Town: lifecycle manager for AI-agent workers
//!
//! Workers run either inside tmux sessions or as process-hosted model
//! sessions. Both backends sit behind [`runtime::AgentRuntime`] and are
//! served over REST and WebSocket by the [`api`] gateway.

pub mod api;
pub mod cli;
pub mod config;
pub mod registry;
pub mod runtime;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GasTownError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("Capacity exceeded: all {0} session slots are in use")]
    CapacityExceeded(usize),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<toml::de::Error> for GasTownError {
    fn from(err: toml::de::Error) -> Self {
        GasTownError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for GasTownError {
    fn from(err: reqwest::Error) -> Self {
        GasTownError::Upstream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GasTownError>;
