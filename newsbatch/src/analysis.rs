use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::llm::{LlmProvider, LlmRequest};

/// Produces a free-text financial analysis of the news of the last `window_days` days
#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, news: &str, window_days: i64) -> Result<String>;
}

/// LLM-backed analyzer
pub struct AiAnalyzer {
    provider: Arc<dyn LlmProvider>,
}

impl AiAnalyzer {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }
}

pub fn analysis_prompt(news: &str, window_days: i64) -> String {
    format!(
        "Below is the news of the past {} days. Give a brief financial analysis and recommend \
         3 related market sectors with a match score for each. Base the analysis only on the \
         content provided; do not drift to other topics.\n{}",
        window_days, news
    )
}

#[async_trait::async_trait]
impl Analyzer for AiAnalyzer {
    async fn analyze(&self, news: &str, window_days: i64) -> Result<String> {
        let response = self
            .provider
            .generate(LlmRequest::new(analysis_prompt(news, window_days)))
            .await
            .with_context(|| format!("{}-day analysis request failed", window_days))?;

        let content = response.content.trim();
        if content.is_empty() {
            anyhow::bail!("{}-day analysis response was empty", window_days);
        }
        info!(
            "{}-day analysis generated by {} ({} tokens)",
            window_days, response.model, response.usage.total_tokens
        );
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmResponse, UsageMetadata};
    use std::sync::Mutex;

    struct CannedProvider {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for CannedProvider {
        async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
            self.prompts.lock().unwrap().push(request.prompt);
            Ok(LlmResponse {
                content: self.reply.clone(),
                usage: UsageMetadata::default(),
                model: "canned".to_string(),
            })
        }
    }

    fn provider(reply: &str) -> Arc<CannedProvider> {
        Arc::new(CannedProvider {
            reply: reply.to_string(),
            prompts: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn prompt_carries_window_and_news() {
        let canned = provider("  Banks up.  \n");
        let analyzer = AiAnalyzer::new(canned.clone());

        let text = analyzer.analyze("- A\n- B\n", 7).await.unwrap();
        assert_eq!(text, "Banks up.");

        let prompts = canned.prompts.lock().unwrap();
        assert!(prompts[0].contains("past 7 days"));
        assert!(prompts[0].ends_with("- A\n- B\n"));
    }

    #[tokio::test]
    async fn blank_reply_is_an_error() {
        let analyzer = AiAnalyzer::new(provider("   "));
        assert!(analyzer.analyze("- A\n", 3).await.is_err());
    }
}
