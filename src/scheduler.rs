//! Periodic producer of extraction tasks
//!
//! Waits an initial grace period, then enqueues one `AuthenticateAndExtract`
//! task per interval. A cycle is skipped while the task it created last is
//! still pending or running.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::queue::{TaskKind, TaskQueue};
use crate::utils::errors::{RpaError, RpaResult};

#[derive(Debug, Default)]
struct SchedulerState {
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    current_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub interval_secs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub current_task_id: Option<String>,
    pub time_until_next_run_secs: Option<i64>,
}

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    config: SchedulerConfig,
    auto_retry: bool,
    state: Mutex<SchedulerState>,
    runtime: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Scheduler {
    /// `auto_retry` is stamped into the params of every task this creates
    pub fn new(queue: Arc<TaskQueue>, config: SchedulerConfig, auto_retry: bool) -> Self {
        Self {
            queue,
            config,
            auto_retry,
            state: Mutex::new(SchedulerState::default()),
            runtime: Mutex::new(None),
        }
    }

    /// Spawn the timer loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut runtime = self.runtime.lock();
        if runtime.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            info!("Scheduler already running");
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(self).run(token.clone()));
        *runtime = Some((token, handle));
        info!("Scheduler started, interval {}s", self.config.interval_secs);
        true
    }

    /// Signal the loop and wait for it to leave its current wait
    pub async fn stop(&self) {
        let Some((token, handle)) = self.runtime.lock().take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!("Scheduler task ended abnormally: {}", e);
        }
        self.state.lock().next_run_at = None;
        info!("Scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.runtime
            .lock()
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.config.initial_delay()) => {}
        }

        loop {
            let interval = self.config.interval();
            let next = Utc::now() + chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero());
            self.state.lock().next_run_at = Some(next);
            info!("Next scheduled run at {}", next.format("%Y-%m-%d %H:%M:%S"));

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.run_cycle() {
                error!("Scheduled run failed: {}", e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_backoff()) => {}
                }
            }
        }
    }

    /// One trigger attempt: enqueue unless the previous task is still in flight.
    /// Returns the new task id, or `None` when the cycle was skipped.
    pub fn run_cycle(&self) -> RpaResult<Option<String>> {
        let previous = {
            let mut state = self.state.lock();
            state.last_run_at = Some(Utc::now());
            state.current_task_id.clone()
        };

        if let Some(previous) = previous {
            match self.queue.get(&previous) {
                Ok(task) if task.status.is_in_flight() => {
                    info!("Previous task {} still {}, skipping this cycle", previous, task.status);
                    return Ok(None);
                }
                Ok(_) | Err(RpaError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let id = self.queue.enqueue(TaskKind::AuthenticateAndExtract, self.params("scheduled"))?;
        self.state.lock().current_task_id = Some(id.clone());
        info!("Scheduled task created: {}", id);
        Ok(Some(id))
    }

    /// Enqueue immediately, bypassing the wait and the in-flight check.
    /// Does not become the task later cycles dedupe against.
    pub fn force_run(&self) -> RpaResult<String> {
        let id = self.queue.enqueue(TaskKind::AuthenticateAndExtract, self.params("forced"))?;
        info!("Forced run requested: {}", id);
        Ok(id)
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock();
        SchedulerStatus {
            running: self.is_running(),
            interval_secs: self.config.interval_secs,
            last_run_at: state.last_run_at,
            next_run_at: state.next_run_at,
            current_task_id: state.current_task_id.clone(),
            time_until_next_run_secs: state.next_run_at.map(|next| (next - Utc::now()).num_seconds()),
        }
    }

    fn params(&self, trigger: &str) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("auto_retry".into(), json!(self.auto_retry));
        params.insert(trigger.into(), json!(true));
        params.insert("scheduled_at".into(), json!(Utc::now().to_rfc3339()));
        params
    }
}
