//! Command scheduler and background job runner.
//!
//! [`CommandScheduler`] turns a command into a [`CommandJob`] and hands it to
//! a [`JobRunner`], retrying the hand-off itself with backoff. The runner
//! executes jobs on its own bounded worker pool through a
//! [`CommandJobExecutor`], which treats an already-processed command as done
//! and rethrows everything else so the runner's own retry applies.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::bus::MessageBus;
use payflow_core::clock::Clock;
use payflow_core::command::Command;
use payflow_core::error::DomainError;
use payflow_core::key::new_key;
use payflow_core::message::RawMessage;
use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use crate::retry::{RetryPolicy, retry_with_backoff};

/// A command waiting for background execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandJob {
    /// Identifier of the job.
    pub job_id: Uuid,
    /// The command to send.
    pub command: RawMessage,
    /// Earliest execution time; `None` runs as soon as a worker is free.
    pub run_at: Option<DateTime<Utc>>,
}

/// Background job system contract.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Accept a job for execution.
    async fn enqueue(&self, job: CommandJob) -> Result<(), DomainError>;
}

/// Body of every command job: send the command through the bus.
pub struct CommandJobExecutor {
    bus: Arc<dyn MessageBus>,
}

impl CommandJobExecutor {
    /// Create an executor sending through `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Run one job.
    ///
    /// # Errors
    ///
    /// Returns any bus or handler error other than `DomainError::Duplicate`,
    /// which is logged and treated as success.
    pub async fn execute(&self, job: &CommandJob) -> Result<(), DomainError> {
        match self.bus.send_command(job.command.clone(), None).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_duplicate() => {
                tracing::info!(
                    job_id = %job.job_id,
                    command_type = %job.command.message_type,
                    original_aggregate_key = ?e.original_aggregate_key(),
                    "command already processed; skipping"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    job_id = %job.job_id,
                    command_type = %job.command.message_type,
                    error = %e,
                    "command job failed"
                );
                Err(e)
            }
        }
    }
}

/// Job runner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRunnerConfig {
    /// Jobs executing at once.
    pub workers: usize,
    /// Retry applied to failing jobs.
    pub retry: RetryPolicy,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(60))
                .jitter(true)
                .build(),
        }
    }
}

/// A [`JobRunner`] executing jobs on tokio tasks, at most `workers` at a time.
pub struct TokioJobRunner {
    executor: Arc<CommandJobExecutor>,
    clock: Arc<dyn Clock>,
    workers: Arc<Semaphore>,
    retry: RetryPolicy,
    accepting: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TokioJobRunner {
    /// Create a runner.
    #[must_use]
    pub fn new(
        executor: Arc<CommandJobExecutor>,
        clock: Arc<dyn Clock>,
        config: JobRunnerConfig,
    ) -> Self {
        Self {
            executor,
            clock,
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            retry: config.retry,
            accepting: AtomicBool::new(true),
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Jobs accepted and not yet finished, including delayed ones.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every accepted job has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs and wait for the accepted ones.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.wait_idle().await;
        tracing::info!("job runner stopped");
    }
}

#[async_trait]
impl JobRunner for TokioJobRunner {
    async fn enqueue(&self, job: CommandJob) -> Result<(), DomainError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DomainError::CommandExecutionFailed(
                "job runner is shutting down".into(),
            ));
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let delay = job.run_at.map(|at| self.clock.delay_until(at));
        let executor = Arc::clone(&self.executor);
        let workers = Arc::clone(&self.workers);
        let retry = self.retry.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let idle = Arc::clone(&self.idle);

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Ok(_worker) = workers.acquire_owned().await {
                let result = retry_with_backoff(&retry, || executor.execute(&job)).await;
                if let Err(e) = result {
                    tracing::error!(
                        job_id = %job.job_id,
                        command_type = %job.command.message_type,
                        error = %e,
                        "command job abandoned after retries"
                    );
                }
            }
            if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
        Ok(())
    }
}

/// Immediate and delayed command execution on top of a [`JobRunner`].
pub struct CommandScheduler {
    runner: Arc<dyn JobRunner>,
    clock: Arc<dyn Clock>,
    enqueue_retry: RetryPolicy,
}

impl CommandScheduler {
    /// Create a scheduler.
    #[must_use]
    pub fn new(runner: Arc<dyn JobRunner>, clock: Arc<dyn Clock>) -> Self {
        Self {
            runner,
            clock,
            enqueue_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(200))
                .build(),
        }
    }

    /// Override the retry protecting the enqueue step.
    #[must_use]
    pub fn with_enqueue_retry(mut self, retry: RetryPolicy) -> Self {
        self.enqueue_retry = retry;
        self
    }

    /// Execute `command` in the background as soon as possible.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Serialization` if the command cannot be encoded,
    /// or `DomainError::CommandExecutionFailed` if it cannot be enqueued.
    pub async fn run_now<C: Command>(&self, command: &C) -> Result<Uuid, DomainError> {
        self.enqueue(RawMessage::command(command)?, None).await
    }

    /// Execute `command` in the background after `delay`.
    ///
    /// # Errors
    ///
    /// See [`CommandScheduler::run_now`].
    pub async fn run_delayed<C: Command>(
        &self,
        delay: Duration,
        command: &C,
    ) -> Result<Uuid, DomainError> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| DomainError::CommandExecutionFailed(format!("invalid delay: {e}")))?;
        let run_at = self.clock.now() + delay;
        self.enqueue(RawMessage::command(command)?, Some(run_at))
            .await
    }

    async fn enqueue(
        &self,
        command: RawMessage,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid, DomainError> {
        let job = CommandJob {
            job_id: new_key(),
            command,
            run_at,
        };
        retry_with_backoff(&self.enqueue_retry, || self.runner.enqueue(job.clone()))
            .await
            .map_err(|e| {
                DomainError::CommandExecutionFailed(format!(
                    "could not enqueue {}: {e}",
                    job.command.message_type
                ))
            })?;
        tracing::debug!(
            job_id = %job.job_id,
            command_type = %job.command.message_type,
            ?run_at,
            "command enqueued"
        );
        Ok(job.job_id)
    }
}
