use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::{Method, Status};
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, post, routes, Build, Data, Rocket, State};
use serde_json::json;

use common::ServerConfig;

use crate::models::AnalysisWindow;
use crate::scheduler::{PipelineQueue, SubmitError, TriggerOrigin};
use crate::storage::Store;
use crate::traffic::TrafficAggregator;

/// Application state stored inside Rocket managed state.
#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub store: Arc<dyn Store>,
    pub traffic: Arc<TrafficAggregator>,
    /// `None` when no upstream AI provider is configured
    pub queue: Option<PipelineQueue>,
    /// Bearer token accepted by admin routes; admin routes are closed when unset
    pub admin_token: Option<String>,
}

/// Counts every non-OPTIONS request against the client IP.
pub struct VisitCounter {
    traffic: Arc<TrafficAggregator>,
}

impl VisitCounter {
    pub fn new(traffic: Arc<TrafficAggregator>) -> Self {
        Self { traffic }
    }
}

#[rocket::async_trait]
impl Fairing for VisitCounter {
    fn info(&self) -> Info {
        Info {
            name: "Visit counter",
            kind: Kind::Request,
        }
    }

    async fn on_request(&self, req: &mut Request<'_>, _data: &mut Data<'_>) {
        if req.method() == Method::Options {
            return;
        }
        let ip = req
            .client_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        self.traffic.record_visit(&ip);
    }
}

/// Raw `Authorization: Bearer ...` value, if any. Checked by the handler.
pub struct BearerToken(Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let token = req
            .headers()
            .get_one("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
        Outcome::Success(BearerToken(token))
    }
}

impl BearerToken {
    fn matches(&self, expected: Option<&str>) -> bool {
        match (self.0.as_deref(), expected) {
            (Some(given), Some(expected)) => !expected.is_empty() && given == expected,
            _ => false,
        }
    }
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

/// Uptime and whether manual runs are accepted.
#[get("/api/status")]
async fn status(state: &State<AppState>) -> Json<serde_json::Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "status": "ok",
        "uptime_seconds": uptime,
        "pipeline_enabled": state.queue.is_some(),
    }))
}

/// Latest batch with its news items.
#[get("/api/news/latest")]
async fn latest_news(state: &State<AppState>) -> Result<Json<serde_json::Value>, Status> {
    let batch = state.store.latest_batch().await.map_err(|e| {
        tracing::error!("failed to load latest batch: {:#}", e);
        Status::InternalServerError
    })?;

    let Some(batch) = batch else {
        return Ok(Json(json!({
            "code": 0,
            "msg": "No news generated yet",
            "rows": [],
        })));
    };

    let rows = state
        .store
        .news_items_for_batch(batch.id)
        .await
        .map_err(|e| {
            tracing::error!("failed to load news for batch {}: {:#}", batch.id, e);
            Status::InternalServerError
        })?;

    Ok(Json(json!({
        "code": 200,
        "msg": "success",
        "rows": rows,
        "batch": batch,
    })))
}

/// Latest analysis; `days=7` selects the 7-day window, anything else the 3-day one.
#[get("/api/analysis/latest?<days>")]
async fn latest_analysis(
    state: &State<AppState>,
    days: Option<i64>,
) -> Result<Json<serde_json::Value>, Status> {
    let window = AnalysisWindow::from_days(days.unwrap_or(3));
    let analysis = state.store.latest_analysis(window).await.map_err(|e| {
        tracing::error!("failed to load latest {} analysis: {:#}", window, e);
        Status::InternalServerError
    })?;

    Ok(Json(match analysis {
        Some(analysis) => json!({ "code": 200, "msg": "success", "data": analysis }),
        None => json!({ "code": 0, "msg": "No analysis found", "data": null }),
    }))
}

#[get("/api/traffic/total")]
async fn traffic_total(state: &State<AppState>) -> Result<Json<serde_json::Value>, Status> {
    let total = state.traffic.total_visits().await.map_err(|e| {
        tracing::error!("failed to read total visits: {:#}", e);
        Status::InternalServerError
    })?;
    Ok(Json(json!({ "code": 200, "msg": "success", "data": total })))
}

/// Queue a pipeline run and return immediately with its id.
#[post("/api/admin/trigger-update")]
async fn trigger_update(
    state: &State<AppState>,
    token: BearerToken,
) -> Result<(Status, Json<serde_json::Value>), Status> {
    if !token.matches(state.admin_token.as_deref()) {
        return Err(Status::Unauthorized);
    }

    let Some(queue) = &state.queue else {
        tracing::warn!("manual trigger rejected: pipeline not configured");
        return Err(Status::ServiceUnavailable);
    };

    match queue.submit(TriggerOrigin::Manual) {
        Ok(handle) => Ok((
            Status::Accepted,
            Json(json!({ "code": 200, "msg": "success", "run_id": handle.id })),
        )),
        Err(SubmitError::QueueFull) => {
            tracing::warn!("manual trigger rejected: pipeline queue is full");
            Err(Status::ServiceUnavailable)
        }
        Err(e @ SubmitError::Closed) => {
            tracing::error!("manual trigger failed: {}", e);
            Err(Status::InternalServerError)
        }
    }
}

/// Assemble the Rocket instance with managed state, routes and the visit counter.
pub fn build_rocket(state: AppState, server: Option<&ServerConfig>) -> Rocket<Build> {
    let mut fig = rocket::Config::figment();
    if let Some(server) = server {
        if let Some(bind) = &server.bind {
            fig = fig.merge(("address", bind.clone()));
        }
        if let Some(port) = server.port {
            fig = fig.merge(("port", port));
        }
    }

    let counter = VisitCounter::new(state.traffic.clone());
    rocket::custom(fig)
        .attach(counter)
        .manage(state)
        .mount(
            "/",
            routes![
                health,
                status,
                latest_news,
                latest_analysis,
                traffic_total,
                trigger_update
            ],
        )
}

/// Launch the server; blocks until Rocket shuts down (SIGINT/SIGTERM etc.).
pub async fn launch_rocket(state: AppState, server: Option<&ServerConfig>) -> Result<()> {
    tracing::info!("Starting Rocket HTTP server");
    build_rocket(state, server)
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    tracing::info!("Rocket HTTP server has shut down");
    Ok(())
}
