use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::llm::{extract_json_array, LlmProvider, LlmRequest, LlmTool};
use crate::models::NewsHeadline;
use crate::pipeline::{Clock, SystemClock};

/// Source of today's headline candidates
#[async_trait::async_trait]
pub trait NewsFetcher: Send + Sync {
    async fn fetch(&self) -> Result<Vec<NewsHeadline>>;
}

const SYSTEM_PROMPT: &str = "You are a news desk assistant. Search today's top news. \
Reply with the JSON array only: no reasoning, no Markdown.";

/// Search results the model may read per headline request
pub const DEFAULT_WEB_SEARCH_LIMIT: u32 = 50;

/// Asks an LLM with web access to compile today's headlines.
pub struct AiNewsSource {
    provider: Arc<dyn LlmProvider>,
    clock: Arc<dyn Clock>,
    headline_count: usize,
    /// `None` sends a plain completion without the search tool
    web_search_limit: Option<u32>,
}

impl AiNewsSource {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            clock: Arc::new(SystemClock),
            headline_count: 20,
            web_search_limit: Some(DEFAULT_WEB_SEARCH_LIMIT),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_headline_count(mut self, count: usize) -> Self {
        self.headline_count = count.max(1);
        self
    }

    pub fn with_web_search(mut self, limit: Option<u32>) -> Self {
        self.web_search_limit = limit;
        self
    }

    fn request(&self, today: &str) -> LlmRequest {
        let request = LlmRequest::new(self.prompt(today)).with_system(SYSTEM_PROMPT);
        match self.web_search_limit {
            Some(limit) => request.with_tool(LlmTool::WebSearch { limit }),
            None => request,
        }
    }

    fn prompt(&self, today: &str) -> String {
        format!(
            "Search the web across at least 10 outlets and summarize the domestic and \
             international top stories published on {today}, tagging each headline with its \
             publication time. Merge stories that report the same event and return {count} \
             items as a JSON array of objects with \"title\" and \"url\" fields. Each url \
             must be the real original report (e.g. Xinhua, People's Daily, Reuters); never \
             invent links, and drop a story rather than guess its url. Do not include \
             Markdown or any other text.\n\
             Example: [{{\"title\": \"[2024-01-01 08:00:00] Story one\", \
             \"url\": \"https://real-news-link...\"}}]",
            today = today,
            count = self.headline_count,
        )
    }
}

#[async_trait::async_trait]
impl NewsFetcher for AiNewsSource {
    async fn fetch(&self) -> Result<Vec<NewsHeadline>> {
        let today = self.clock.now().format("%Y-%m-%d").to_string();
        info!("requesting top headlines for {}", today);

        let response = self
            .provider
            .generate(self.request(&today))
            .await
            .context("headline request failed")?;

        let headlines = parse_headlines(&response.content)?;
        info!(
            "received {} headlines ({} tokens)",
            headlines.len(),
            response.usage.total_tokens
        );
        Ok(headlines)
    }
}

/// Parse a model reply into deduplicated headlines.
///
/// Blank titles are dropped; duplicates are detected by normalized URL, or by title when
/// an item has no usable URL. First occurrence wins.
pub fn parse_headlines(reply: &str) -> Result<Vec<NewsHeadline>> {
    let json = extract_json_array(reply.trim())
        .with_context(|| format!("no JSON array in headline response: {}", reply))?;
    let raw: Vec<NewsHeadline> = serde_json::from_str(json)
        .with_context(|| format!("failed to parse headline response: {}", reply))?;

    let mut seen = HashSet::new();
    let mut headlines = Vec::with_capacity(raw.len());
    for item in raw {
        let title = item.title.trim().to_string();
        if title.is_empty() {
            debug!("dropping headline without title: {:?}", item.url);
            continue;
        }
        let url = item.url.trim().to_string();
        let key = dedup_key(&title, &url);
        if !seen.insert(key) {
            debug!("dropping duplicate headline: {}", title);
            continue;
        }
        headlines.push(NewsHeadline { title, url });
    }
    Ok(headlines)
}

fn dedup_key(title: &str, url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.has_host() => {
            parsed.set_fragment(None);
            let normalized = parsed.as_str().trim_end_matches('/').to_string();
            format!("url:{}", normalized)
        }
        _ => format!("title:{}", title.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_array() {
        let reply = r#"```json
[{"title": "A", "url": "https://example.com/a"}, {"title": "B", "url": "https://example.com/b"}]
```"#;
        let headlines = parse_headlines(reply).unwrap();
        assert_eq!(headlines.len(), 2);
        assert_eq!(headlines[0].title, "A");
        assert_eq!(headlines[1].url, "https://example.com/b");
    }

    #[test]
    fn dedups_by_url_then_title() {
        let reply = r#"[
            {"title": "Rates held", "url": "https://News.example.com/rates#top"},
            {"title": "Rates held steady", "url": "https://news.example.com/rates/"},
            {"title": "No link", "url": ""},
            {"title": "no link"},
            {"title": "   ", "url": "https://example.com/blank"}
        ]"#;
        let headlines = parse_headlines(reply).unwrap();
        let titles: Vec<_> = headlines.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Rates held", "No link"]);
    }

    #[test]
    fn malformed_reply_is_an_error() {
        assert!(parse_headlines("sorry, nothing found").is_err());
        assert!(parse_headlines("[{\"headline\": 1}]").is_err());
    }

    #[test]
    fn headline_request_carries_search_tool() {
        let provider: Arc<dyn LlmProvider> =
            Arc::new(crate::llm::remote::RemoteLlmProvider::new("http://x", "k", "m"));

        let source = AiNewsSource::new(provider.clone());
        let request = source.request("2026-06-15");
        assert_eq!(request.tools, vec![LlmTool::WebSearch { limit: 50 }]);
        assert!(request.prompt.contains("2026-06-15"));

        let plain = AiNewsSource::new(provider).with_web_search(None);
        assert!(plain.request("2026-06-15").tools.is_empty());
    }

    #[test]
    fn empty_array_is_valid() {
        assert!(parse_headlines("[]").unwrap().is_empty());
    }
}
