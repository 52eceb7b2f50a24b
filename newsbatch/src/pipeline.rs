use anyhow::Result;
use chrono::{DateTime, Duration, FixedOffset, Local, TimeZone, Timelike, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::analysis::Analyzer;
use crate::ingestion::NewsFetcher;
use crate::models::{
    AnalysisRecord, AnalysisWindow, BatchKind, BatchRecord, NewAnalysis, NewBatch, NewNewsItem,
    NewsItemRecord,
};
use crate::storage::Store;

/// Source label stored on every fetched news item
pub const NEWS_SOURCE_LABEL: &str = "AI Summary";

/// Wall-clock source for the pipeline
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Local system time
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().into()
    }
}

/// Clock pinned to one instant
pub struct FixedClock(pub DateTime<FixedOffset>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        self.0
    }
}

/// Batch kind for the wall-clock hour of `now` in its own timezone.
pub fn classify<Tz: TimeZone>(now: &DateTime<Tz>) -> BatchKind {
    BatchKind::for_hour(now.hour())
}

/// What a completed run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub batch: BatchRecord,
    pub items_saved: usize,
    pub items_failed: usize,
    pub analyses: Vec<AnalysisRecord>,
}

/// Fetch, persist and analyze one news batch.
pub struct UpdatePipeline {
    store: Arc<dyn Store>,
    fetcher: Arc<dyn NewsFetcher>,
    analyzer: Arc<dyn Analyzer>,
    clock: Arc<dyn Clock>,
    run_analysis: bool,
}

impl UpdatePipeline {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: Arc<dyn NewsFetcher>,
        analyzer: Arc<dyn Analyzer>,
    ) -> Self {
        Self {
            store,
            fetcher,
            analyzer,
            clock: Arc::new(SystemClock),
            run_analysis: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_analysis(mut self, enabled: bool) -> Self {
        self.run_analysis = enabled;
        self
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        self.run_with_id(Uuid::new_v4()).await
    }

    /// Run once under the given id.
    ///
    /// Errors only when the fetch or the batch insert fails; in both cases nothing was
    /// persisted. Item and analysis failures are logged and reflected in the outcome.
    pub async fn run_with_id(&self, run_id: Uuid) -> Result<RunOutcome> {
        let now = self.clock.now();
        let kind = classify(&now);
        let span = info_span!("pipeline_run", %run_id, %kind);
        self.execute(run_id, now, kind).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        now: DateTime<FixedOffset>,
        kind: BatchKind,
    ) -> Result<RunOutcome> {
        info!("starting update run");
        let created_at = now.with_timezone(&Utc);

        let headlines = match self.fetcher.fetch().await {
            Ok(headlines) => headlines,
            Err(e) => {
                error!("failed to fetch news, aborting run: {:#}", e);
                return Err(e.context("failed to fetch daily news"));
            }
        };

        let batch = match self
            .store
            .create_batch(NewBatch {
                kind,
                date: now.format("%Y-%m-%d").to_string(),
                created_at,
            })
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!("failed to create batch, aborting run: {:#}", e);
                return Err(e.context("failed to create batch"));
            }
        };
        info!(batch_id = batch.id, date = %batch.date, "created batch");

        let mut items_saved = 0;
        let mut items_failed = 0;
        for headline in headlines {
            let item = NewNewsItem {
                batch_id: batch.id,
                content: headline.title.clone(),
                title: headline.title,
                url: headline.url,
                source: NEWS_SOURCE_LABEL.to_string(),
                created_at,
            };
            match self.store.create_news_item(item).await {
                Ok(saved) => {
                    items_saved += 1;
                    debug!("saved news item {}: {} ({})", saved.id, saved.title, saved.url);
                }
                Err(e) => {
                    items_failed += 1;
                    warn!("failed to save news item: {:#}", e);
                }
            }
        }
        info!("saved {} news items ({} failed)", items_saved, items_failed);

        let mut analyses = Vec::new();
        if self.run_analysis {
            for window in AnalysisWindow::ALL {
                match self.analyze_window(batch.id, window, now).await {
                    Ok(Some(record)) => analyses.push(record),
                    Ok(None) => {}
                    Err(e) => error!("{} analysis failed: {:#}", window, e),
                }
            }
        }

        info!("update run finished");
        Ok(RunOutcome {
            run_id,
            batch,
            items_saved,
            items_failed,
            analyses,
        })
    }

    /// Analyze every news item of the trailing window ending at `now` and store the result
    /// under `batch_id`. Returns `None` when the window holds no news.
    pub async fn analyze_window(
        &self,
        batch_id: i64,
        window: AnalysisWindow,
        now: DateTime<FixedOffset>,
    ) -> Result<Option<AnalysisRecord>> {
        let days = window.days();
        let cutoff = (now - Duration::days(days)).with_timezone(&Utc);
        let recent = self.store.find_news_items_since(cutoff).await?;
        if recent.is_empty() {
            info!("no news in the last {} days, skipping analysis", days);
            return Ok(None);
        }

        info!("analyzing {} news items over {} days", recent.len(), days);
        let content = self.analyzer.analyze(&news_digest(&recent), days).await?;

        let record = self
            .store
            .create_analysis(NewAnalysis {
                batch_id,
                window,
                content,
                created_at: now.with_timezone(&Utc),
            })
            .await?;
        info!("saved {} analysis {}", window, record.id);
        Ok(Some(record))
    }
}

/// One `- <content>` line per item, in the given order.
pub fn news_digest(items: &[NewsItemRecord]) -> String {
    let mut digest = String::new();
    for item in items {
        digest.push_str("- ");
        digest.push_str(&item.content);
        digest.push('\n');
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 6, 15, hour, minute, second)
            .unwrap()
    }

    #[test]
    fn classification_boundaries() {
        assert_eq!(classify(&at(0, 0, 0)), BatchKind::Morning);
        assert_eq!(classify(&at(9, 59, 59)), BatchKind::Morning);
        assert_eq!(classify(&at(10, 0, 0)), BatchKind::Noon);
        assert_eq!(classify(&at(15, 59, 59)), BatchKind::Noon);
        assert_eq!(classify(&at(16, 0, 0)), BatchKind::Evening);
        assert_eq!(classify(&at(23, 59, 59)), BatchKind::Evening);
    }

    #[test]
    fn classification_uses_local_wall_clock() {
        // 01:30 UTC is 09:30 at +08:00
        let utc = Utc.with_ymd_and_hms(2026, 6, 15, 1, 30, 0).unwrap();
        let local = utc.with_timezone(&FixedOffset::east_opt(8 * 3600).unwrap());
        assert_eq!(classify(&local), BatchKind::Morning);
        let east_ten = FixedOffset::east_opt(10 * 3600).unwrap();
        assert_eq!(classify(&local.with_timezone(&east_ten)), BatchKind::Noon);
    }

    #[test]
    fn digest_is_one_line_per_item() {
        let item = |content: &str| NewsItemRecord {
            id: 0,
            batch_id: 1,
            title: content.to_string(),
            content: content.to_string(),
            url: String::new(),
            source: NEWS_SOURCE_LABEL.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(news_digest(&[item("A"), item("B")]), "- A\n- B\n");
        assert_eq!(news_digest(&[]), "");
    }
}
