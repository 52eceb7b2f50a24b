use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{LlmProvider, LlmRequest, LlmResponse, LlmTool, UsageMetadata};

/// Remote LLM provider using OpenAI-compatible HTTP API
///
/// Plain requests go to the chat-completions `base_url`. Requests carrying tools go to
/// the responses endpoint (`search_url`, falling back to `base_url`).
pub struct RemoteLlmProvider {
    base_url: String,
    search_url: Option<String>,
    api_key: String,
    model: String,
    default_timeout: Duration,
    default_max_tokens: usize,
    default_temperature: f32,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            search_url: None,
            api_key: api_key.into(),
            model: model.into(),
            default_timeout: Duration::from_secs(180),
            default_max_tokens: 4096,
            default_temperature: 0.7,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(
        mut self,
        timeout_secs: u64,
        max_tokens: usize,
        temperature: f32,
    ) -> Self {
        self.default_timeout = Duration::from_secs(timeout_secs);
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    /// Endpoint for tool-using requests (e.g. `.../v3/responses`)
    pub fn with_search_url(mut self, url: impl Into<String>) -> Self {
        self.search_url = Some(url.into());
        self
    }

    fn chat_body(&self, request: LlmRequest) -> RequestBody<'_> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = request.system {
            messages.push(OutgoingMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(OutgoingMessage {
            role: "user",
            content: request.prompt,
        });

        RequestBody::Chat(ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.default_max_tokens,
            temperature: self.default_temperature,
        })
    }

    fn responses_body(&self, request: LlmRequest) -> RequestBody<'_> {
        let mut input = Vec::with_capacity(2);
        if let Some(system) = request.system {
            input.push(InputMessage::text("system", system));
        }
        input.push(InputMessage::text("user", request.prompt));

        RequestBody::Responses(ResponsesRequest {
            model: &self.model,
            input,
            tools: request.tools,
            stream: false,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = self.default_timeout;

        let (url, req_body) = if request.tools.is_empty() {
            (self.base_url.as_str(), self.chat_body(request))
        } else {
            let url = self.search_url.as_deref().unwrap_or(&self.base_url);
            (url, self.responses_body(request))
        };

        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(&req_body)
                .send(),
        )
        .await
        .context("LLM request timed out")?
        .context("LLM HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let body = tokio::time::timeout(timeout, response.text())
            .await
            .context("LLM request timed out")?
            .context("Failed to read LLM response body")?;

        let resp_body: OpenAiResponse = serde_json::from_str(&body)
            .with_context(|| format!("Failed to parse LLM response: {}", body))?;

        let content = resp_body
            .message_content()
            .map(content_text)
            .context("LLM response has neither choices nor an assistant output")?;

        let usage = resp_body.usage.unwrap_or_default();

        Ok(LlmResponse {
            content,
            usage: UsageMetadata {
                prompt_tokens: usage.prompt_tokens.or(usage.input_tokens).unwrap_or(0),
                completion_tokens: usage.completion_tokens.or(usage.output_tokens).unwrap_or(0),
                total_tokens: usage.total_tokens.unwrap_or(0),
            },
            model: resp_body.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// Message content is either a plain string or a list of typed parts.
fn content_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestBody<'a> {
    Chat(ChatRequest<'a>),
    Responses(ResponsesRequest<'a>),
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OutgoingMessage>,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OutgoingMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<InputMessage>,
    tools: Vec<LlmTool>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: &'static str,
    content: Vec<InputContent>,
}

impl InputMessage {
    fn text(role: &'static str, text: String) -> Self {
        Self {
            role,
            content: vec![InputContent {
                kind: "input_text",
                text,
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct InputContent {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

/// Chat completions answer in `choices`; the responses endpoint answers in `output`.
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl OpenAiResponse {
    fn message_content(&self) -> Option<&serde_json::Value> {
        if let Some(choice) = self.choices.first() {
            return Some(&choice.message.content);
        }
        // Search calls and reasoning items precede the assistant message
        self.output
            .iter()
            .find(|item| item.role.as_deref() == Some("assistant") || item.kind == "message")
            .map(|item| &item.content)
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: IncomingMessage,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    input_tokens: Option<usize>,
    #[serde(default)]
    output_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}
