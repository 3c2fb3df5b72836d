//! Anthropic Messages API client and wire types.

use crate::config::ProcessConfig;
use crate::runtime::types::ToolConfig;
use crate::{GasTownError, Result};
use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// Block kinds we neither send nor act on (thinking, etc.)
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelResponse {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl ModelResponse {
    pub fn wants_tools(&self) -> bool {
        self.stop_reason.as_deref() == Some("tool_use")
    }
}

/// One round trip to a language model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest, cancel: &CancellationToken) -> Result<ModelResponse>;
}

pub struct AnthropicClient {
    http: reqwest::Client,
    url: String,
}

impl AnthropicClient {
    pub fn new(config: &ProcessConfig, api_key: &str) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        let key = header::HeaderValue::from_str(api_key)
            .map_err(|_| GasTownError::Config("api_key is not a valid header value".to_string()))?;
        headers.insert("x-api-key", key);
        headers.insert("anthropic-version", header::HeaderValue::from_static(API_VERSION));

        let http = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            url: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &ModelRequest, cancel: &CancellationToken) -> Result<ModelResponse> {
        debug!(model = %request.model, messages = request.messages.len(), "Calling Messages API");

        let send = async {
            let response = self.http.post(&self.url).json(request).send().await?;
            let status = response.status();
            let body = response.text().await?;
            if !status.is_success() {
                return Err(GasTownError::Upstream(format!("{}: {}", status, body)));
            }
            serde_json::from_str::<ModelResponse>(&body).map_err(|e| {
                GasTownError::Upstream(format!("unparseable model response: {}", e))
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GasTownError::Upstream("request cancelled".to_string())),
            result = send => result,
        }
    }
}
