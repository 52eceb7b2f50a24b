use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::models::{
    AnalysisRecord, AnalysisWindow, BatchRecord, NewAnalysis, NewBatch, NewNewsItem,
    NewsItemRecord, VisitCounterRecord,
};

/// Persistence operations used by the pipeline, the traffic aggregator and the API.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn create_batch(&self, batch: NewBatch) -> Result<BatchRecord>;

    async fn create_news_item(&self, item: NewNewsItem) -> Result<NewsItemRecord>;

    /// All news items created at or after `since`, across every batch.
    async fn find_news_items_since(&self, since: DateTime<Utc>) -> Result<Vec<NewsItemRecord>>;

    async fn create_analysis(&self, analysis: NewAnalysis) -> Result<AnalysisRecord>;

    /// Insert the counter with `delta`, or add `delta` to the existing row atomically.
    async fn upsert_increment_counter(&self, key: &str, delta: i64) -> Result<()>;

    async fn find_counter(&self, key: &str) -> Result<Option<VisitCounterRecord>>;

    async fn latest_batch(&self) -> Result<Option<BatchRecord>>;

    async fn news_items_for_batch(&self, batch_id: i64) -> Result<Vec<NewsItemRecord>>;

    async fn latest_analysis(&self, window: AnalysisWindow) -> Result<Option<AnalysisRecord>>;
}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: i64,
    kind: String,
    date: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BatchRow> for BatchRecord {
    type Error = anyhow::Error;

    fn try_from(row: BatchRow) -> Result<Self> {
        Ok(BatchRecord {
            id: row.id,
            kind: row.kind.parse()?,
            date: row.date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NewsItemRow {
    id: i64,
    batch_id: i64,
    title: String,
    content: String,
    url: String,
    source: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<NewsItemRow> for NewsItemRecord {
    fn from(row: NewsItemRow) -> Self {
        NewsItemRecord {
            id: row.id,
            batch_id: row.batch_id,
            title: row.title,
            content: row.content,
            url: row.url,
            source: row.source,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AnalysisRow {
    id: i64,
    batch_id: i64,
    window_kind: String,
    content: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AnalysisRow> for AnalysisRecord {
    type Error = anyhow::Error;

    fn try_from(row: AnalysisRow) -> Result<Self> {
        Ok(AnalysisRecord {
            id: row.id,
            batch_id: row.batch_id,
            window: row.window_kind.parse()?,
            content: row.content,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CounterRow {
    ip: String,
    count: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

const NEWS_ITEM_COLUMNS: &str =
    "id, batch_id, title, content, url, source, created_at, updated_at";

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn create_batch(&self, batch: NewBatch) -> Result<BatchRecord> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO batches (kind, date, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(batch.kind.as_str())
        .bind(&batch.date)
        .bind(batch.created_at)
        .bind(batch.created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert batch")?;

        Ok(BatchRecord {
            id,
            kind: batch.kind,
            date: batch.date,
            created_at: batch.created_at,
            updated_at: batch.created_at,
        })
    }

    async fn create_news_item(&self, item: NewNewsItem) -> Result<NewsItemRecord> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO news_items (batch_id, title, content, url, source, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(item.batch_id)
        .bind(&item.title)
        .bind(&item.content)
        .bind(&item.url)
        .bind(&item.source)
        .bind(item.created_at)
        .bind(item.created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert news item {:?}", item.title))?;

        Ok(NewsItemRecord {
            id,
            batch_id: item.batch_id,
            title: item.title,
            content: item.content,
            url: item.url,
            source: item.source,
            created_at: item.created_at,
            updated_at: item.created_at,
        })
    }

    async fn find_news_items_since(&self, since: DateTime<Utc>) -> Result<Vec<NewsItemRecord>> {
        let rows = sqlx::query_as::<_, NewsItemRow>(&format!(
            "SELECT {} FROM news_items WHERE created_at >= ? ORDER BY id",
            NEWS_ITEM_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to query recent news items")?;

        debug!("found {} news items since {}", rows.len(), since);
        Ok(rows.into_iter().map(NewsItemRecord::from).collect())
    }

    async fn create_analysis(&self, analysis: NewAnalysis) -> Result<AnalysisRecord> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO analyses (batch_id, window_kind, content, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(analysis.batch_id)
        .bind(analysis.window.as_str())
        .bind(&analysis.content)
        .bind(analysis.created_at)
        .bind(analysis.created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert analysis")?;

        Ok(AnalysisRecord {
            id,
            batch_id: analysis.batch_id,
            window: analysis.window,
            content: analysis.content,
            created_at: analysis.created_at,
            updated_at: analysis.created_at,
        })
    }

    async fn upsert_increment_counter(&self, key: &str, delta: i64) -> Result<()> {
        let now = Utc::now();
        // Single statement so concurrent flushes cannot lose an increment
        sqlx::query(
            r#"
            INSERT INTO traffic_stats (ip, count, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(ip) DO UPDATE SET
                count = traffic_stats.count + excluded.count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(delta)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to increment counter {}", key))?;

        Ok(())
    }

    async fn find_counter(&self, key: &str) -> Result<Option<VisitCounterRecord>> {
        let row = sqlx::query_as::<_, CounterRow>(
            "SELECT ip, count, created_at, updated_at FROM traffic_stats WHERE ip = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read counter {}", key))?;

        Ok(row.map(|r| VisitCounterRecord {
            key: r.ip,
            count: r.count,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }))
    }

    async fn latest_batch(&self) -> Result<Option<BatchRecord>> {
        let row = sqlx::query_as::<_, BatchRow>(
            r#"
            SELECT id, kind, date, created_at, updated_at
            FROM batches
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("failed to query latest batch")?;

        row.map(BatchRecord::try_from).transpose()
    }

    async fn news_items_for_batch(&self, batch_id: i64) -> Result<Vec<NewsItemRecord>> {
        let rows = sqlx::query_as::<_, NewsItemRow>(&format!(
            "SELECT {} FROM news_items WHERE batch_id = ? ORDER BY id",
            NEWS_ITEM_COLUMNS
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list news items for batch {}", batch_id))?;

        Ok(rows.into_iter().map(NewsItemRecord::from).collect())
    }

    async fn latest_analysis(&self, window: AnalysisWindow) -> Result<Option<AnalysisRecord>> {
        let row = sqlx::query_as::<_, AnalysisRow>(
            r#"
            SELECT id, batch_id, window_kind, content, created_at, updated_at
            FROM analyses
            WHERE window_kind = ?
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(window.as_str())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to query latest {} analysis", window))?;

        row.map(AnalysisRecord::try_from).transpose()
    }
}
