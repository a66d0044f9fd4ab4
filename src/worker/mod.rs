//! Single sequential task worker
//!
//! One loop, one task at a time: concurrent logins against the portal would
//! trip its abuse defenses. A failing task never ends the loop.

mod dispatch;

pub use dispatch::{Authenticator, Extractor, LandingPageExtractor};

use futures::FutureExt;
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserDriver, DriverFactory};
use crate::config::WorkerConfig;
use crate::queue::{Task, TaskKind, TaskLog, TaskQueue};
use crate::utils::errors::{RpaError, RpaResult};

/// Upper bound on closing a driver after a task
const DRIVER_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

fn panicked() -> RpaError {
    RpaError::Extraction("task panicked".into())
}

pub struct Worker {
    queue: Arc<TaskQueue>,
    drivers: Arc<dyn DriverFactory>,
    authenticator: Arc<dyn Authenticator>,
    extractor: Arc<dyn Extractor>,
    config: WorkerConfig,
    runtime: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Worker {
    pub fn new(
        queue: Arc<TaskQueue>,
        drivers: Arc<dyn DriverFactory>,
        authenticator: Arc<dyn Authenticator>,
        extractor: Arc<dyn Extractor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            drivers,
            authenticator,
            extractor,
            config,
            runtime: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the polling loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut runtime = self.runtime.lock();
        if runtime.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            debug!("Worker already running");
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(token.clone()));
        *runtime = Some((token, handle));
        true
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Ask the loop to stop after the current task and wait up to the
    /// configured grace period for it
    pub async fn stop(&self) {
        let Some((token, handle)) = self.runtime.lock().take() else {
            return;
        };
        token.cancel();

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.config.shutdown_grace(), handle).await {
            Ok(_) => info!("Worker stopped"),
            Err(_) => {
                warn!(
                    "Worker did not stop within {}s, aborting",
                    self.config.shutdown_grace().as_secs()
                );
                abort.abort();
            }
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            "Worker started (poll every {}s, batch {})",
            self.config.poll_interval_secs, self.config.batch_size
        );

        loop {
            let pause = match AssertUnwindSafe(self.process_batch(&token)).catch_unwind().await {
                Ok(Ok(_)) => self.config.poll_interval(),
                Ok(Err(e)) => {
                    error!("Worker cycle failed: {}", e);
                    self.config.error_backoff()
                }
                Err(_) => {
                    error!("Worker cycle panicked");
                    self.config.error_backoff()
                }
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("Worker loop exited");
    }

    /// Process one batch of pending tasks; returns how many were handled
    pub async fn run_once(&self) -> RpaResult<usize> {
        self.process_batch(&CancellationToken::new()).await
    }

    async fn process_batch(&self, token: &CancellationToken) -> RpaResult<usize> {
        let pending = self.queue.list_pending(self.config.batch_size)?;
        if !pending.is_empty() {
            info!("Found {} pending task(s)", pending.len());
        }

        let mut handled = 0;
        for task in pending {
            if token.is_cancelled() {
                break;
            }
            self.process(task).await;
            handled += 1;
        }
        Ok(handled)
    }

    async fn process(&self, task: Task) {
        let task = match self.queue.mark_running(&task.id) {
            Ok(task) => task,
            Err(e) => {
                // Cancelled or otherwise moved on since it was listed
                warn!(task_id = %task.id, "Skipping task: {}", e);
                return;
            }
        };

        let log = TaskLog::new(&task.id, &task.log);
        log.push(format!(
            "Starting {} (attempt {}/{})",
            task.kind,
            task.retry_count + 1,
            task.max_retries
        ));

        let outcome = AssertUnwindSafe(self.execute(&task, &log))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(panicked()));

        match outcome {
            Ok(result) => {
                log.push("Task completed");
                if let Err(e) = self.queue.complete(&task.id, result, log.render()) {
                    error!(task_id = %task.id, "Failed to record completion: {}", e);
                }
            }
            Err(e) => self.record_failure(&task, &e, &log),
        }
    }

    /// Open a driver, run the task under its deadline, always close the driver.
    /// A panic in the dispatched task surfaces as an error like any other.
    async fn execute(&self, task: &Task, log: &TaskLog) -> RpaResult<Value> {
        let task_timeout = self.config.task_timeout();
        let deadline = Instant::now() + task_timeout;
        let timed_out = || RpaError::TaskTimeout(task_timeout.as_secs());

        let driver = tokio::time::timeout_at(deadline, self.drivers.open())
            .await
            .map_err(|_| timed_out())??;

        let dispatched = AssertUnwindSafe(self.dispatch(task, driver.as_ref(), log)).catch_unwind();
        let result = match tokio::time::timeout_at(deadline, dispatched).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(panicked()),
            Err(_) => Err(timed_out()),
        };

        match tokio::time::timeout(DRIVER_CLOSE_TIMEOUT, driver.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(task_id = %task.id, "Driver close failed: {}", e),
            Err(_) => warn!(task_id = %task.id, "Driver close timed out"),
        }

        result
    }

    async fn dispatch(&self, task: &Task, driver: &dyn BrowserDriver, log: &TaskLog) -> RpaResult<Value> {
        let login = self.authenticator.authenticate(driver, log).await?;

        match task.kind {
            TaskKind::AuthenticateOnly => Ok(json!({
                "authenticated": true,
                "mode": login.mode,
                "url": login.final_url,
                "challenge": login.challenge,
            })),
            TaskKind::AuthenticateAndExtract => {
                log.push("Running extraction");
                self.extractor.extract(driver, log).await
            }
        }
    }

    /// `auto_retry` in the task params overrides the worker default
    fn record_failure(&self, task: &Task, err: &RpaError, log: &TaskLog) {
        log.push(format!("Task failed: {}", err));
        error!(task_id = %task.id, "Task failed: {}", err);

        let auto_retry = task
            .params
            .get("auto_retry")
            .and_then(Value::as_bool)
            .unwrap_or(self.config.auto_retry);

        let recorded = if auto_retry && task.retry_count + 1 < task.max_retries {
            let delay = self.config.retry_backoff(task.retry_count);
            log.push(format!("Retrying in {}s", delay.as_secs()));
            let not_before = chrono::Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.queue
                .requeue(&task.id, err.to_string(), log.render(), not_before)
        } else {
            self.queue.fail(&task.id, err.to_string(), log.render())
        };

        if let Err(e) = recorded {
            error!(task_id = %task.id, "Failed to record failure: {}", e);
        }
    }
}
