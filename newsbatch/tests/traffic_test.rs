use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};

use newsbatch::models::{
    AnalysisRecord, AnalysisWindow, BatchRecord, NewAnalysis, NewBatch, NewNewsItem,
    NewsItemRecord, VisitCounterRecord,
};
use newsbatch::storage::{SqliteStore, Store};
use newsbatch::traffic::{TrafficAggregator, TOTAL_VISITS_KEY};

/// Counter-only store that records every upsert and can reject chosen keys.
#[derive(Default)]
struct CounterStore {
    counts: Mutex<HashMap<String, i64>>,
    upserts: Mutex<Vec<(String, i64)>>,
    failing_keys: HashSet<String>,
}

impl CounterStore {
    fn count(&self, key: &str) -> i64 {
        self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    fn upsert_calls(&self) -> usize {
        self.upserts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Store for CounterStore {
    async fn create_batch(&self, _batch: NewBatch) -> Result<BatchRecord> {
        anyhow::bail!("not used")
    }

    async fn create_news_item(&self, _item: NewNewsItem) -> Result<NewsItemRecord> {
        anyhow::bail!("not used")
    }

    async fn find_news_items_since(&self, _since: DateTime<Utc>) -> Result<Vec<NewsItemRecord>> {
        anyhow::bail!("not used")
    }

    async fn create_analysis(&self, _analysis: NewAnalysis) -> Result<AnalysisRecord> {
        anyhow::bail!("not used")
    }

    async fn upsert_increment_counter(&self, key: &str, delta: i64) -> Result<()> {
        self.upserts.lock().unwrap().push((key.to_string(), delta));
        if self.failing_keys.contains(key) {
            anyhow::bail!("disk full");
        }
        *self.counts.lock().unwrap().entry(key.to_string()).or_insert(0) += delta;
        Ok(())
    }

    async fn find_counter(&self, key: &str) -> Result<Option<VisitCounterRecord>> {
        let now = Utc::now();
        Ok(self.counts.lock().unwrap().get(key).map(|count| VisitCounterRecord {
            key: key.to_string(),
            count: *count,
            created_at: now,
            updated_at: now,
        }))
    }

    async fn latest_batch(&self) -> Result<Option<BatchRecord>> {
        Ok(None)
    }

    async fn news_items_for_batch(&self, _batch_id: i64) -> Result<Vec<NewsItemRecord>> {
        Ok(Vec::new())
    }

    async fn latest_analysis(&self, _window: AnalysisWindow) -> Result<Option<AnalysisRecord>> {
        Ok(None)
    }
}

/// Wait for spawned flushes to drain the buffer.
async fn settle(aggregator: &TrafficAggregator) {
    for _ in 0..200 {
        if aggregator.pending_visits() == 0 {
            // Let an in-flight flush finish its writes
            tokio::time::sleep(Duration::from_millis(20)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("visits were never flushed");
}

#[tokio::test]
async fn ten_visits_then_flush_yields_ten() {
    let store = Arc::new(CounterStore::default());
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 10);

    for _ in 0..10 {
        aggregator.record_visit("1.2.3.4");
    }
    aggregator.flush().await;
    settle(&aggregator).await;

    assert_eq!(store.count(TOTAL_VISITS_KEY), 10);
    assert_eq!(store.count("1.2.3.4"), 10);
    assert_eq!(aggregator.total_visits().await.unwrap(), 10);
}

#[tokio::test]
async fn below_threshold_nothing_is_written() {
    let store = Arc::new(CounterStore::default());
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 10);

    for _ in 0..9 {
        aggregator.record_visit("1.2.3.4");
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(store.upsert_calls(), 0);
    assert_eq!(aggregator.pending_visits(), 9);
}

#[tokio::test]
async fn crossing_threshold_flushes_in_background() {
    let store = Arc::new(CounterStore::default());
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 3);

    aggregator.record_visit("10.0.0.1");
    aggregator.record_visit("10.0.0.2");
    aggregator.record_visit("10.0.0.1");
    settle(&aggregator).await;

    assert_eq!(store.count(TOTAL_VISITS_KEY), 3);
    assert_eq!(store.count("10.0.0.1"), 2);
    assert_eq!(store.count("10.0.0.2"), 1);
}

#[tokio::test]
async fn second_flush_without_visits_is_a_noop() {
    let store = Arc::new(CounterStore::default());
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 100);

    aggregator.record_visit("1.2.3.4");
    aggregator.record_visit("5.6.7.8");

    let first = aggregator.flush().await;
    assert_eq!(first.visits, 2);
    assert_eq!(first.rows_written, 3);
    let calls_after_first = store.upsert_calls();

    let second = aggregator.flush().await;
    assert!(second.is_noop());
    assert_eq!(store.upsert_calls(), calls_after_first);
    assert_eq!(store.count(TOTAL_VISITS_KEY), 2);
}

#[tokio::test]
async fn failed_row_does_not_stop_the_others() {
    let store = Arc::new(CounterStore {
        failing_keys: ["5.6.7.8".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 100);

    aggregator.record_visit("1.2.3.4");
    aggregator.record_visit("5.6.7.8");
    aggregator.record_visit("9.9.9.9");

    let report = aggregator.flush().await;
    assert_eq!(report.rows_written, 3);
    assert_eq!(report.rows_failed, 1);
    assert_eq!(store.count(TOTAL_VISITS_KEY), 3);
    assert_eq!(store.count("1.2.3.4"), 1);
    assert_eq!(store.count("9.9.9.9"), 1);

    // The failed delta is dropped, not re-buffered
    assert_eq!(aggregator.pending_visits(), 0);
    assert_eq!(store.count("5.6.7.8"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_visits_and_flushes_keep_exact_totals() {
    let store = Arc::new(CounterStore::default());
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 10);

    let ips = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "2001:db8::1"];
    let mut tasks = Vec::new();
    for (n, ip) in ips.iter().copied().enumerate() {
        let aggregator = aggregator.clone();
        let visits = 50 + n * 7;
        tasks.push(tokio::spawn(async move {
            for i in 0..visits {
                aggregator.record_visit(ip);
                if i % 13 == 0 {
                    aggregator.flush().await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    aggregator.flush().await;
    settle(&aggregator).await;

    let expected_total: usize = (0..ips.len()).map(|n| 50 + n * 7).sum();
    assert_eq!(store.count(TOTAL_VISITS_KEY), expected_total as i64);
    for (n, ip) in ips.iter().enumerate() {
        assert_eq!(store.count(ip), (50 + n * 7) as i64, "ip {}", ip);
    }
}

#[tokio::test]
async fn sqlite_counters_accumulate_across_flushes() {
    let pool = common::init_memory_pool().await.expect("memory pool");
    let store = Arc::new(SqliteStore::new(pool));
    let aggregator = TrafficAggregator::with_threshold(store.clone(), 1000);

    for _ in 0..4 {
        aggregator.record_visit("1.2.3.4");
    }
    aggregator.flush().await;
    for _ in 0..6 {
        aggregator.record_visit("1.2.3.4");
    }
    aggregator.record_visit("4.3.2.1");
    aggregator.flush().await;

    assert_eq!(aggregator.total_visits().await.unwrap(), 11);
    let ip = store.find_counter("1.2.3.4").await.unwrap().unwrap();
    assert_eq!(ip.count, 10);
}
