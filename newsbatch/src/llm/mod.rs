use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod remote;

/// Chat-completion provider backing headline fetching and analysis
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;
}

/// Server-side tool the model may call while answering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmTool {
    /// Live web search; `limit` caps the number of results the model may read
    WebSearch { limit: u32 },
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// Optional system instruction sent ahead of the prompt
    pub system: Option<String>,
    pub prompt: String,
    /// Non-empty tools switch the provider to its tool-capable (responses) endpoint
    pub tools: Vec<LlmTool>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tool(mut self, tool: LlmTool) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Slice out a JSON array from model output that may carry code fences or chatter.
///
/// Takes everything from the first `[` to the last `]`.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_array_from_fenced_reply() {
        let reply = "Here you go:\n```json\n[{\"title\": \"A\"}]\n```\n";
        assert_eq!(extract_json_array(reply), Some("[{\"title\": \"A\"}]"));
    }

    #[test]
    fn web_search_tool_wire_shape() {
        let tool = serde_json::to_value(LlmTool::WebSearch { limit: 50 }).unwrap();
        assert_eq!(tool, serde_json::json!({"type": "web_search", "limit": 50}));
    }

    #[test]
    fn no_array_in_plain_text() {
        assert_eq!(extract_json_array("nothing today"), None);
        assert_eq!(extract_json_array("] backwards ["), None);
    }
}
