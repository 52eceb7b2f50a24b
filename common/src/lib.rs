/*!
common/src/lib.rs

Shared configuration types and DB helper functions for newsbatch.

This file provides:
- Config data structures (deserialized from TOML)
- A loader merging a default config file with an optional override
- Helpers to open and migrate the SQLite database
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsbatch.db")
    pub path: String,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock times in "HH:MM" 24h local time when the update pipeline fires
    pub times: Vec<String>,
    /// How many pipeline runs may wait in the queue before triggers are refused
    pub queue_capacity: Option<usize>,
    /// Whether the 3-day and 7-day analyses run after each batch
    pub run_analysis: Option<bool>,
}

/// Visit counter buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Number of buffered visits that triggers a flush to the database
    pub flush_threshold: Option<i64>,
}

/// Upstream OpenAI-compatible endpoint used for headlines and analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    /// Model used for the headline fetch; falls back to `model`
    pub search_model: Option<String>,
    /// Responses endpoint used for web-search requests; falls back to `api_url`
    pub search_api_url: Option<String>,
    /// Search results per headline request; 0 disables the web search tool
    pub web_search_limit: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub headline_count: Option<usize>,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Env var holding the bearer token accepted by the manual trigger endpoint
    pub token_env: Option<String>,
    pub auto_migrate: Option<bool>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub llm: Option<LlmConfig>,
    pub traffic: Option<TrafficConfig>,
    pub server: Option<ServerConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration from a single TOML file.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn auto_migrate(&self) -> bool {
        self.admin
            .as_ref()
            .and_then(|a| a.auto_migrate)
            .unwrap_or(true)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run the SQL migrations embedded from the workspace `migrations` directory.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory and the DB file if necessary so path or permission
/// problems surface here rather than on the first query. The pool is small (5
/// connections) and uses WAL journaling.
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Open a migrated single-connection in-memory database.
///
/// Every SQLite `:memory:` connection is its own database, so the pool is pinned to
/// one connection.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory sqlite database")?;
    run_migrations(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [database]
        path = "data/test.db"

        [scheduler]
        times = ["08:00", "12:00", "18:00"]
        queue_capacity = 4

        [traffic]
        flush_threshold = 10
    "#;

    #[test]
    fn config_from_string() {
        let cfg: Config = toml::from_str(BASE).expect("parse config");
        assert_eq!(cfg.scheduler.times.len(), 3);
        assert_eq!(cfg.scheduler.queue_capacity, Some(4));
        assert_eq!(cfg.traffic.and_then(|t| t.flush_threshold), Some(10));
        assert!(cfg.llm.is_none());
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");
        std::fs::write(&default_path, BASE).expect("write default");
        std::fs::write(
            &override_path,
            "[scheduler]\ntimes = [\"07:30\"]\n\n[admin]\nauto_migrate = false\n",
        )
        .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");

        assert_eq!(cfg.scheduler.times, vec!["07:30".to_string()]);
        // Keys missing from the override survive the merge
        assert_eq!(cfg.scheduler.queue_capacity, Some(4));
        assert_eq!(cfg.database.path, "data/test.db");
        assert!(!cfg.auto_migrate());
    }

    #[tokio::test]
    async fn missing_override_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        std::fs::write(&default_path, BASE).expect("write default");

        let cfg = Config::load_with_defaults(
            Some(&default_path),
            Some(&dir.path().join("absent.toml")),
        )
        .await
        .expect("load config");
        assert!(cfg.auto_migrate());
    }

    #[tokio::test]
    async fn db_pool_and_migrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("newsbatch.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        run_migrations(&pool).await.expect("migrate");

        let tables: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name FROM sqlite_master
            WHERE type = 'table' AND name NOT LIKE '\_%' ESCAPE '\' AND name != 'sqlite_sequence'
            ORDER BY name
            "#,
        )
        .fetch_all(&pool)
        .await
        .expect("list tables");
        assert_eq!(tables, vec!["analyses", "batches", "news_items", "traffic_stats"]);
    }
}
