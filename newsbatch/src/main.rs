/*
newsbatch - single-binary main.rs
Starts the Rocket HTTP server, the pipeline runner and the wall-clock scheduler in one process.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::{Config, LlmConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newsbatch::analysis::AiAnalyzer;
use newsbatch::ingestion::{AiNewsSource, DEFAULT_WEB_SEARCH_LIMIT};
use newsbatch::llm::remote::RemoteLlmProvider;
use newsbatch::llm::LlmProvider;
use newsbatch::pipeline::UpdatePipeline;
use newsbatch::scheduler::{self, PipelineQueue};
use newsbatch::server::{launch_rocket, AppState};
use newsbatch::storage::{SqliteStore, Store};
use newsbatch::traffic::{TrafficAggregator, DEFAULT_FLUSH_THRESHOLD};

#[derive(Parser, Debug)]
#[command(name = "newsbatch", about = "AI news batches, windowed analysis and visit counting")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Do not fire the pipeline at the configured times (manual triggers still work)
    #[arg(long)]
    no_scheduler: bool,

    /// Run the pipeline once, wait for it, and exit without starting the server
    #[arg(long)]
    run_once: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .map_err(|e| {
        error!("failed to load configuration: {:#}", e);
        e
    })?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let db_pool = common::init_db_pool(&config.database.path)
        .await
        .map_err(|e| {
            error!(db_path = %config.database.path, "failed to initialize database pool: {:#}", e);
            e
        })?;
    if config.auto_migrate() {
        info!("running DB migrations");
        common::run_migrations(&db_pool).await?;
    }

    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(db_pool));
    let threshold = config
        .traffic
        .as_ref()
        .and_then(|t| t.flush_threshold)
        .unwrap_or(DEFAULT_FLUSH_THRESHOLD);
    let traffic = TrafficAggregator::with_threshold(store.clone(), threshold);

    let pipeline = match config.llm.as_ref() {
        Some(llm_config) => match build_pipeline(llm_config, store.clone(), &config) {
            Ok(pipeline) => Some(Arc::new(pipeline)),
            Err(e) => {
                error!("failed to initialize update pipeline: {:#}", e);
                None
            }
        },
        None => {
            warn!("no [llm] section configured, update pipeline disabled");
            None
        }
    };

    if args.run_once {
        let pipeline = pipeline.context("--run-once requires a configured [llm] section")?;
        let outcome = pipeline.run().await?;
        info!(
            batch_id = outcome.batch.id,
            "run finished: {} items saved, {} failed, {} analyses",
            outcome.items_saved,
            outcome.items_failed,
            outcome.analyses.len()
        );
        return Ok(());
    }

    let shutdown_notify = Arc::new(Notify::new());

    let capacity = config.scheduler.queue_capacity.unwrap_or(4);
    let (queue, runner_handle) = match pipeline {
        Some(pipeline) => {
            let (queue, handle) = PipelineQueue::start(pipeline, capacity);
            (Some(queue), Some(handle))
        }
        None => (None, None),
    };

    let mut scheduler_handle = None;
    match (&queue, args.no_scheduler) {
        (Some(queue), false) => {
            let times = scheduler::parse_times(&config.scheduler.times)?;
            let queue = queue.clone();
            let shutdown = shutdown_notify.clone();
            scheduler_handle = Some(tokio::spawn(async move {
                if let Err(e) = scheduler::run_scheduler(queue, times, shutdown).await {
                    error!("scheduler failed: {:#}", e);
                }
            }));
        }
        (Some(_), true) => info!("Scheduler disabled via CLI (--no-scheduler)"),
        (None, _) => info!("Scheduler not started: pipeline unavailable"),
    }

    let admin_token = config
        .admin
        .as_ref()
        .and_then(|a| a.token_env.as_deref())
        .and_then(|var| std::env::var(var).ok())
        .filter(|t| !t.is_empty());
    if admin_token.is_none() {
        warn!("no admin token configured, manual trigger endpoint is closed");
    }

    let state = AppState {
        started_at: Utc::now(),
        store: store.clone(),
        traffic: traffic.clone(),
        queue,
        admin_token,
    };

    info!("Launching Rocket HTTP server");
    if let Err(e) = launch_rocket(state, config.server.as_ref()).await {
        error!("Rocket server failed: {:#}", e);
    }

    info!("HTTP server stopped; shutting down background tasks");
    shutdown_notify.notify_one();

    if let Some(handle) = scheduler_handle {
        if let Err(join_err) = handle.await {
            error!(%join_err, "scheduler task panicked");
        }
    }

    // The runner stops once the last queue handle (dropped with Rocket's state) is gone
    if let Some(handle) = runner_handle {
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(())) => info!("pipeline runner exited cleanly"),
            Ok(Err(join_err)) => error!(%join_err, "pipeline runner panicked"),
            Err(_) => info!("Timed out waiting for pipeline runner; continuing shutdown"),
        }
    }

    let report = traffic.flush().await;
    if !report.is_noop() {
        info!("flushed {} buffered visits on shutdown", report.visits);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wire the AI-backed fetcher and analyzer into a pipeline.
fn build_pipeline(
    llm_config: &LlmConfig,
    store: Arc<dyn Store>,
    config: &Config,
) -> Result<UpdatePipeline> {
    let api_key_env = llm_config
        .api_key_env
        .as_deref()
        .context("Missing api_key_env in [llm] config")?;
    let api_key = std::env::var(api_key_env)
        .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;
    let api_url = llm_config
        .api_url
        .clone()
        .context("Missing api_url in [llm] config")?;
    let model = llm_config
        .model
        .clone()
        .context("Missing model in [llm] config")?;
    let timeout_secs = llm_config.timeout_seconds.unwrap_or(180);
    let max_tokens = llm_config.max_tokens.unwrap_or(4096);

    let analysis_llm: Arc<dyn LlmProvider> = Arc::new(
        RemoteLlmProvider::new(&api_url, &api_key, &model)
            .with_defaults(timeout_secs, max_tokens, 0.7),
    );

    let search_model = llm_config.search_model.as_deref().unwrap_or(&model);
    let mut search_llm = RemoteLlmProvider::new(&api_url, &api_key, search_model)
        .with_defaults(timeout_secs, max_tokens, 0.7);
    if let Some(search_url) = &llm_config.search_api_url {
        search_llm = search_llm.with_search_url(search_url);
    }
    let web_search = match llm_config.web_search_limit.unwrap_or(DEFAULT_WEB_SEARCH_LIMIT) {
        0 => None,
        limit => Some(limit),
    };
    info!(
        "LLM provider initialized: {} (headlines: {}, web search: {:?}) at {}",
        model, search_model, web_search, api_url
    );

    let fetcher = AiNewsSource::new(Arc::new(search_llm))
        .with_headline_count(llm_config.headline_count.unwrap_or(20))
        .with_web_search(web_search);
    let analyzer = AiAnalyzer::new(analysis_llm);

    Ok(UpdatePipeline::new(store, Arc::new(fetcher), Arc::new(analyzer))
        .with_analysis(config.scheduler.run_analysis.unwrap_or(true)))
}
