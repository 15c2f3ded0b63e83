//! Agent invocation: request construction and the HTTP transport.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use salesguard_core::config::AgentConfig;
use salesguard_core::SearchFilter;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

pub const AGENT_RUN_PATH: &str = "/api/v2/cortex/agent:run";
pub const ANALYST_TOOL_TYPE: &str = "cortex_analyst_text_to_sql";
pub const SEARCH_TOOL_TYPE: &str = "cortex_search";

const BODY_PREVIEW_CHARS: usize = 200;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("agent transport failure: {0}")]
    Transport(String),
    #[error("agent returned status {status}: {reason}")]
    Status { status: u16, reason: String },
    #[error("agent returned a malformed body: {0}")]
    MalformedBody(String),
}

/// Response body exactly as received, before decoding.
#[derive(Clone, Debug, PartialEq)]
pub enum RawResponse {
    Events(Vec<Value>),
    /// A bare string body. Carries no decodable events.
    Opaque(String),
}

impl RawResponse {
    pub fn from_body(body: &str) -> Result<Self, DispatchError> {
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Array(events)) => Ok(Self::Events(events)),
            Ok(Value::String(text)) => Ok(Self::Opaque(text)),
            Ok(Value::Null) => Ok(Self::Events(Vec::new())),
            Ok(other) => Err(DispatchError::MalformedBody(format!(
                "expected an event array, found {}",
                json_kind(&other)
            ))),
            Err(error) => Err(DispatchError::MalformedBody(error.to_string())),
        }
    }
}

/// Model and tool bindings sent with every agent call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentToolConfig {
    pub model: String,
    pub analyst_tool_name: String,
    pub semantic_model_file: String,
    pub search_tool_name: String,
    pub search_service: String,
    pub id_column: String,
}

impl AgentToolConfig {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            model: config.model.clone(),
            analyst_tool_name: config.analyst_tool_name.clone(),
            semantic_model_file: config.semantic_model_file.clone(),
            search_tool_name: config.search_tool_name.clone(),
            search_service: config.search_service.clone(),
            id_column: config.id_column.clone(),
        }
    }

    /// Agent request body. `filter` is attached to the search tool only when
    /// present.
    pub fn request_body(
        &self,
        query: &str,
        result_limit: u32,
        filter: Option<&SearchFilter>,
    ) -> Value {
        let mut search = Map::new();
        search.insert("name".to_string(), json!(self.search_service));
        search.insert("max_results".to_string(), json!(result_limit));
        search.insert("id_column".to_string(), json!(self.id_column));
        if let Some(filter) = filter {
            search.insert("filter".to_string(), filter.to_json());
        }

        let mut tool_resources = Map::new();
        tool_resources.insert(
            self.analyst_tool_name.clone(),
            json!({ "semantic_model_file": self.semantic_model_file }),
        );
        tool_resources.insert(self.search_tool_name.clone(), Value::Object(search));

        json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": [{ "type": "text", "text": query }] }
            ],
            "tools": [
                { "tool_spec": { "type": ANALYST_TOOL_TYPE, "name": self.analyst_tool_name } },
                { "tool_spec": { "type": SEARCH_TOOL_TYPE, "name": self.search_tool_name } }
            ],
            "tool_resources": tool_resources,
        })
    }
}

#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        query: &str,
        result_limit: u32,
        filter: Option<&SearchFilter>,
    ) -> Result<RawResponse, DispatchError>;
}

/// Calls the agent run endpoint of the warehouse account.
#[derive(Clone, Debug)]
pub struct HttpAgentDispatcher {
    http: reqwest::Client,
    endpoint: String,
    pat_token: SecretString,
    tools: AgentToolConfig,
}

impl HttpAgentDispatcher {
    pub fn new(
        account_url: &str,
        pat_token: SecretString,
        tools: AgentToolConfig,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DispatchError::Transport(error.to_string()))?;
        let endpoint = format!("{}{AGENT_RUN_PATH}", account_url.trim_end_matches('/'));
        Ok(Self { http, endpoint, pat_token, tools })
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self, DispatchError> {
        Self::new(
            &config.account_url,
            config.pat_token.clone(),
            AgentToolConfig::from_config(config),
            Duration::from_millis(config.timeout_ms),
        )
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn dispatch(
        &self,
        query: &str,
        result_limit: u32,
        filter: Option<&SearchFilter>,
    ) -> Result<RawResponse, DispatchError> {
        let body = self.tools.request_body(query, result_limit, filter);

        let response = self
            .http
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.pat_token.expose_secret()))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                warn!(
                    event_name = "agent.dispatch.transport_failed",
                    error = %error,
                    "agent call failed"
                );
                DispatchError::Transport(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("Unknown reason").to_string();
            warn!(
                event_name = "agent.dispatch.status",
                status = status.as_u16(),
                reason = %reason,
                "agent returned a non-success status"
            );
            return Err(DispatchError::Status { status: status.as_u16(), reason });
        }

        let text =
            response.text().await.map_err(|error| DispatchError::Transport(error.to_string()))?;
        let raw = RawResponse::from_body(&text).map_err(|error| {
            warn!(
                event_name = "agent.dispatch.malformed_body",
                error = %error,
                body_preview = %body_preview(&text),
                "agent response could not be parsed"
            );
            error
        })?;

        let event_count = match &raw {
            RawResponse::Events(events) => events.len(),
            RawResponse::Opaque(_) => 0,
        };
        info!(
            event_name = "agent.dispatch.completed",
            has_filter = filter.is_some(),
            result_limit,
            event_count,
            "agent call completed"
        );
        Ok(raw)
    }
}

fn body_preview(body: &str) -> String {
    body.chars().take(BODY_PREVIEW_CHARS).collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
