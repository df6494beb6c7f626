//! Background task queue for verification mail.
//!
//! Architecture:
//!   - `LocalTaskQueue::enqueue` pushes onto an unbounded tokio channel and
//!     never blocks the request path
//!   - `run_workers` pulls jobs, bounded by a semaphore of `workers` permits
//!   - each job runs under its own deadline; `Retry` outcomes are re-queued
//!     after an exponential backoff (1s doubling, capped at 60s) until
//!     `max_retries`, `Permanent` outcomes are dropped
//!   - a job waiting out its backoff has already released its permit
//!   - cancelling the shutdown token stops intake, drains running jobs and
//!     drops pending retries

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::mail::{MailSender, TaskOutcome, VerificationMailer};
use crate::metrics::ServerMetrics;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmailTask {
    VerifyEmail { email: String },
}

impl EmailTask {
    pub fn kind(&self) -> &'static str {
        match self {
            EmailTask::VerifyEmail { .. } => "verify_email",
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

/// Fire-and-forget job submission. `timeout` bounds a single run of the job.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, task: EmailTask, timeout: Duration) -> Result<(), QueueError>;
}

#[derive(Debug)]
pub struct Job {
    pub task: EmailTask,
    pub timeout: Duration,
    pub attempt: u32,
}

/// In-process queue feeding [`run_workers`].
#[derive(Clone)]
pub struct LocalTaskQueue {
    tx: mpsc::UnboundedSender<Job>,
}

pub type JobReceiver = mpsc::UnboundedReceiver<Job>;

pub fn local_queue() -> (LocalTaskQueue, JobReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LocalTaskQueue { tx }, rx)
}

impl LocalTaskQueue {
    fn push(&self, job: Job) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|_| QueueError::Closed)
    }
}

impl TaskQueue for LocalTaskQueue {
    fn enqueue(&self, task: EmailTask, timeout: Duration) -> Result<(), QueueError> {
        self.push(Job {
            task,
            timeout,
            attempt: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub max_retries: u32,
}

pub fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE
        .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
        .map_or(BACKOFF_CAP, |d| d.min(BACKOFF_CAP))
}

/// Run mail jobs until `shutdown` is cancelled, then wait for in-flight jobs.
pub async fn run_workers<S: MailSender>(
    mut rx: JobReceiver,
    queue: LocalTaskQueue,
    mailer: Arc<VerificationMailer<S>>,
    settings: PoolSettings,
    metrics: ServerMetrics,
    shutdown: CancellationToken,
    span: Span,
) {
    let workers = settings.workers.max(1);
    let semaphore = Arc::new(Semaphore::new(workers));
    tracing::info!(parent: &span, workers, max_retries = settings.max_retries, "mail worker pool ready");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!(parent: &span, "mail workers: shutdown signal received, draining...");
                break;
            }
            job = rx.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = semaphore.clone().acquire_owned().await else { break };
                let ctx = JobContext {
                    queue: queue.clone(),
                    mailer: mailer.clone(),
                    max_retries: settings.max_retries,
                    metrics: metrics.clone(),
                    shutdown: shutdown.clone(),
                    span: span.clone(),
                };
                tokio::spawn(async move {
                    let retry = ctx.execute(job).await;
                    drop(permit);
                    if let Some((next, delay)) = retry {
                        ctx.requeue_after(next, delay).await;
                    }
                });
            }
        }
    }

    let _ = semaphore.acquire_many(workers as u32).await;
    tracing::info!(parent: &span, "mail workers: all running jobs complete");
}

struct JobContext<S> {
    queue: LocalTaskQueue,
    mailer: Arc<VerificationMailer<S>>,
    max_retries: u32,
    metrics: ServerMetrics,
    shutdown: CancellationToken,
    span: Span,
}

impl<S: MailSender> JobContext<S> {
    /// Run one attempt. Returns the follow-up job and its delay when the
    /// attempt should be retried.
    async fn execute(&self, job: Job) -> Option<(Job, Duration)> {
        let outcome = match &job.task {
            EmailTask::VerifyEmail { email } => {
                match tokio::time::timeout(job.timeout, self.mailer.handle(email)).await {
                    Ok(outcome) => outcome,
                    Err(_) => TaskOutcome::Retry(format!("timed out after {:?}", job.timeout)),
                }
            }
        };

        match outcome {
            TaskOutcome::Success => {
                self.metrics.mail_job("success");
                None
            }
            TaskOutcome::Permanent(reason) => {
                tracing::warn!(parent: &self.span, task = job.task.kind(), %reason, "mail job dropped");
                self.metrics.mail_job("permanent");
                None
            }
            TaskOutcome::Retry(reason) if job.attempt < self.max_retries => {
                let delay = backoff(job.attempt);
                tracing::warn!(
                    parent: &self.span,
                    task = job.task.kind(),
                    attempt = job.attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "mail job failed, retrying"
                );
                self.metrics.mail_job("retry");
                let next = Job {
                    attempt: job.attempt + 1,
                    ..job
                };
                Some((next, delay))
            }
            TaskOutcome::Retry(reason) => {
                tracing::error!(
                    parent: &self.span,
                    task = job.task.kind(),
                    attempts = job.attempt + 1,
                    %reason,
                    "mail job failed after all retries"
                );
                self.metrics.mail_job("exhausted");
                None
            }
        }
    }

    async fn requeue_after(&self, next: Job, delay: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                tracing::warn!(
                    parent: &self.span,
                    task = next.task.kind(),
                    attempt = next.attempt,
                    "shutdown during backoff, mail retry dropped"
                );
                self.metrics.mail_job("dropped");
            }
            _ = tokio::time::sleep(delay) => {
                if self.queue.push(next).is_err() {
                    tracing::warn!(parent: &self.span, "mail queue closed, retry lost");
                }
            }
        }
    }
}
