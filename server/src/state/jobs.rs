//! Background job queue
//!
//! Scans, cancellations and confirmation checks run here rather than on the
//! caller's task. Delivery is at-least-once: a job whose handler fails with a
//! retryable error is pushed back after a backoff, so every handler must be
//! idempotent.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    server_config::JobsConfig,
    state::{
        cancellation::{engine::CancellationEngine, monitor::ConfirmationMonitor},
        scan::orchestrator::ScanOrchestrator,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Scan {
        user_id: Uuid,
        session_id: Uuid,
        lookback_years: u32,
    },
    Cancellation {
        action_id: Uuid,
    },
    ConfirmationCheck {
        action_id: Uuid,
    },
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Scan { .. } => "scan",
            Job::Cancellation { .. } => "cancellation",
            Job::ConfirmationCheck { .. } => "confirmation_check",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub job: Job,
    /// Deliveries so far, starting at 1 for the first
    pub attempt: u32,
}

/// FIFO of pending jobs shared between producers and the runner
#[derive(Clone, Default)]
pub struct JobQueue {
    jobs: Arc<Mutex<VecDeque<QueuedJob>>>,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.push_queued(QueuedJob { job, attempt: 1 });
    }

    fn push_queued(&self, queued: QueuedJob) {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(queued);
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<QueuedJob> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next job
    pub async fn next(&self) -> QueuedJob {
        loop {
            if let Some(job) = self.pop() {
                return job;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> AppResult<()>;
}

/// Routes each job to the pipeline component that owns it
pub struct PipelineHandler {
    orchestrator: Arc<ScanOrchestrator>,
    engine: Arc<CancellationEngine>,
    monitor: Arc<ConfirmationMonitor>,
}

impl PipelineHandler {
    pub fn new(
        orchestrator: Arc<ScanOrchestrator>,
        engine: Arc<CancellationEngine>,
        monitor: Arc<ConfirmationMonitor>,
    ) -> Self {
        Self {
            orchestrator,
            engine,
            monitor,
        }
    }
}

#[async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, job: &Job) -> AppResult<()> {
        match *job {
            Job::Scan {
                user_id,
                session_id,
                lookback_years,
            } => {
                self.orchestrator
                    .run(user_id, session_id, lookback_years)
                    .await?;
            }
            Job::Cancellation { action_id } => {
                self.engine.execute(action_id).await?;
            }
            Job::ConfirmationCheck { action_id } => {
                self.monitor.check(action_id, Utc::now()).await?;
            }
        }
        Ok(())
    }
}

/// What happened to a single delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Done,
    Redelivered { attempt: u32 },
    Dropped { error: String },
}

#[derive(Clone)]
pub struct JobRunner {
    handler: Arc<dyn JobHandler>,
    queue: JobQueue,
    config: JobsConfig,
}

impl JobRunner {
    pub fn new(handler: Arc<dyn JobHandler>, queue: JobQueue, config: JobsConfig) -> Self {
        Self {
            handler,
            queue,
            config,
        }
    }

    /// Pull jobs until `shutdown` fires. Each delivery runs on its own task.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Starting job runner...");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Job runner shutting down with {} queued", self.queue.len());
                    break;
                }
                queued = self.queue.next() => {
                    let runner = self.clone();
                    tokio::spawn(async move {
                        runner.deliver(queued).await;
                    });
                }
            }
        }
    }

    /// Run one delivery. A retryable failure is pushed back after the
    /// redelivery backoff until `max_attempts` is reached.
    pub async fn deliver(&self, queued: QueuedJob) -> Delivery {
        let kind = queued.job.kind();
        let result = AssertUnwindSafe(self.handler.handle(&queued.job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "Unknown panic".to_string());
                Err(AppError::Internal(anyhow::anyhow!("{} job panicked: {}", kind, msg)))
            });

        let error = match result {
            Ok(()) => {
                tracing::debug!("{} job done on attempt {}", kind, queued.attempt);
                return Delivery::Done;
            }
            Err(e) => e,
        };

        if error.is_retryable() && queued.attempt < self.config.max_attempts {
            let attempt = queued.attempt + 1;
            tracing::warn!(
                "{} job failed on attempt {}, redelivering: {}",
                kind,
                queued.attempt,
                error
            );
            tokio::time::sleep(Duration::from_millis(self.config.redelivery_backoff_ms)).await;
            self.queue.push_queued(QueuedJob {
                job: queued.job,
                attempt,
            });
            return Delivery::Redelivered { attempt };
        }

        tracing::error!(
            "{} job dropped after {} attempt(s): {}",
            kind,
            queued.attempt,
            error
        );
        Delivery::Dropped {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyHandler {
        failures: usize,
        retryable: bool,
        calls: AtomicUsize,
    }

    impl FlakyHandler {
        fn new(failures: usize, retryable: bool) -> Self {
            Self {
                failures,
                retryable,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, _job: &Job) -> AppResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.retryable {
                    AppError::Repository("connection reset".to_string())
                } else {
                    AppError::Auth("revoked".to_string())
                });
            }
            Ok(())
        }
    }

    fn config() -> JobsConfig {
        JobsConfig {
            max_attempts: 3,
            redelivery_backoff_ms: 1,
            tracker_log_interval_secs: 30,
        }
    }

    fn job() -> Job {
        Job::Cancellation {
            action_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_queue_is_fifo() {
        let queue = JobQueue::new();
        let (a, b) = (job(), job());
        queue.push(a.clone());
        queue.push(b.clone());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().job, a);
        assert_eq!(queue.pop().unwrap().job, b);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = JobQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let j = job();
        queue.push(j.clone());

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, QueuedJob { job: j, attempt: 1 });
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered_until_limit() {
        let queue = JobQueue::new();
        let handler = Arc::new(FlakyHandler::new(usize::MAX, true));
        let runner = JobRunner::new(handler.clone(), queue.clone(), config());

        queue.push(job());
        let first = runner.deliver(queue.pop().unwrap()).await;
        assert_eq!(first, Delivery::Redelivered { attempt: 2 });
        let second = runner.deliver(queue.pop().unwrap()).await;
        assert_eq!(second, Delivery::Redelivered { attempt: 3 });
        let third = runner.deliver(queue.pop().unwrap()).await;
        assert!(matches!(third, Delivery::Dropped { .. }));
        assert!(queue.is_empty());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_dropped() {
        let queue = JobQueue::new();
        let runner = JobRunner::new(Arc::new(FlakyHandler::new(1, false)), queue.clone(), config());

        let outcome = runner.deliver(QueuedJob { job: job(), attempt: 1 }).await;
        match outcome {
            Delivery::Dropped { error } => assert!(error.contains("Authentication failed")),
            other => panic!("unexpected delivery {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let queue = JobQueue::new();
        let handler = Arc::new(FlakyHandler::new(1, true));
        let runner = JobRunner::new(handler.clone(), queue.clone(), config());
        let shutdown = CancellationToken::new();

        let task = {
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { runner.run(shutdown).await })
        };
        queue.push(job());
        queue.push(job());

        // one failure plus two successes
        for _ in 0..100 {
            if handler.calls.load(Ordering::SeqCst) >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
