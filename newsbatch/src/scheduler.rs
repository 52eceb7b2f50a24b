use anyhow::{Context, Result};
use chrono::{Local, NaiveTime, Timelike};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::{RunOutcome, UpdatePipeline};

/// Why a run was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOrigin {
    Scheduled,
    Manual,
}

impl fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerOrigin::Scheduled => f.write_str("scheduled"),
            TriggerOrigin::Manual => f.write_str("manual"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("pipeline queue is full")]
    QueueFull,
    #[error("pipeline runner has stopped")]
    Closed,
}

struct RunRequest {
    id: Uuid,
    origin: TriggerOrigin,
    reply: oneshot::Sender<Result<RunOutcome>>,
}

/// Handle to a submitted run. Dropping it does not cancel the run.
pub struct RunHandle {
    pub id: Uuid,
    reply: oneshot::Receiver<Result<RunOutcome>>,
}

impl RunHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.reply
            .await
            .context("pipeline runner dropped the run before completing it")?
    }
}

/// Bounded queue of pipeline runs consumed by a single runner task, so runs never overlap.
#[derive(Clone)]
pub struct PipelineQueue {
    tx: mpsc::Sender<RunRequest>,
}

impl PipelineQueue {
    /// Spawn the runner task. It exits once every queue handle is dropped and the
    /// backlog is drained.
    pub fn start(pipeline: Arc<UpdatePipeline>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RunRequest>(capacity.max(1));

        let runner = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                info!(run_id = %request.id, origin = %request.origin, "pipeline run dequeued");
                let result = pipeline.run_with_id(request.id).await;
                if let Ok(outcome) = &result {
                    info!(
                        run_id = %request.id,
                        batch_id = outcome.batch.id,
                        "pipeline run completed: {} items saved, {} failed, {} analyses",
                        outcome.items_saved,
                        outcome.items_failed,
                        outcome.analyses.len()
                    );
                }
                if request.reply.send(result).is_err() {
                    debug!(run_id = %request.id, "run requester no longer waiting");
                }
            }
            info!("pipeline runner stopped");
        });

        (Self { tx }, runner)
    }

    /// Enqueue a run without waiting for it.
    pub fn submit(&self, origin: TriggerOrigin) -> Result<RunHandle, SubmitError> {
        let (reply, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        self.tx
            .try_send(RunRequest { id, origin, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
            })?;
        info!(run_id = %id, origin = %origin, "pipeline run queued");
        Ok(RunHandle { id, reply: rx })
    }
}

/// Parse "HH:MM" entries; the result is sorted and deduplicated.
pub fn parse_times(times: &[String]) -> Result<Vec<NaiveTime>> {
    let mut parsed = times
        .iter()
        .map(|t| {
            NaiveTime::parse_from_str(t.trim(), "%H:%M")
                .with_context(|| format!("invalid scheduler time {:?}, expected HH:MM", t))
        })
        .collect::<Result<Vec<_>>>()?;
    parsed.sort();
    parsed.dedup();
    Ok(parsed)
}

/// Six-field cron expression (seconds first) firing daily at `time`.
pub fn cron_expression(time: NaiveTime) -> String {
    format!("0 {} {} * * *", time.minute(), time.hour())
}

/// Cron scheduler with one local-time job per entry in `times`; each job submits a
/// scheduled run. The returned scheduler is not started.
pub async fn build_scheduler(queue: PipelineQueue, times: &[NaiveTime]) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for time in times {
        let cron = cron_expression(*time);
        let queue = queue.clone();
        let job = Job::new_async_tz(cron.as_str(), Local, move |_uuid, _l| {
            let queue = queue.clone();
            Box::pin(async move {
                match queue.submit(TriggerOrigin::Scheduled) {
                    Ok(handle) => debug!(run_id = %handle.id, "scheduler: run submitted"),
                    Err(e) => error!("scheduler: could not submit run: {}", e),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

/// Submit a scheduled run at each configured local time until `shutdown` is notified.
pub async fn run_scheduler(
    queue: PipelineQueue,
    times: Vec<NaiveTime>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    if times.is_empty() {
        warn!("scheduler: no times configured, scheduled runs disabled");
        return Ok(());
    }

    let mut sched = build_scheduler(queue, &times).await?;
    sched.start().await.context("starting scheduler")?;
    info!("scheduler: firing daily at {:?}", times);

    shutdown.notified().await;
    info!("scheduler: shutdown requested");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
