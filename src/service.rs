//! Composition root and the thin enqueue/observe surface

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::browser::DriverFactory;
use crate::captcha::{ChallengeSolver, build_solver};
use crate::config::{ChallengeMode, Config};
use crate::login::{LoginMachine, StaticCredentials};
use crate::queue::{Task, TaskKind, TaskQueue, TaskSummary};
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::session::SessionStore;
use crate::utils::errors::RpaResult;
use crate::worker::{LandingPageExtractor, Worker};

/// Owns the queue and both background loops
pub struct RpaService {
    queue: Arc<TaskQueue>,
    sessions: Arc<SessionStore>,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    scheduler_enabled: bool,
    session_cleanup_after: Duration,
}

impl RpaService {
    /// Wire the default login machine, solver and extractor around `drivers`
    ///
    /// A missing solver key is not fatal here: the first full login that
    /// needs it fails with a configuration error instead.
    pub fn build(config: &Config, drivers: Arc<dyn DriverFactory>) -> RpaResult<Self> {
        let queue = Arc::new(TaskQueue::open(&config.database_path)?);
        let sessions = Arc::new(SessionStore::open(
            &config.sessions_dir,
            config.portal.target_domain()?,
        )?);

        let solver: Option<Arc<dyn ChallengeSolver>> = match config.portal.challenge_mode {
            ChallengeMode::Manual => None,
            ChallengeMode::Solver => match build_solver(&config.captcha) {
                Ok(solver) => Some(solver),
                Err(e) => {
                    warn!("Challenge solver unavailable: {}", e);
                    None
                }
            },
        };

        let login = Arc::new(LoginMachine::new(
            config.portal.clone(),
            config.session.identity.clone(),
            config.session.max_age(),
            sessions.clone(),
            solver,
            Arc::new(StaticCredentials::from_portal(&config.portal)),
            config.diagnostics_dir.clone(),
        )?);

        let worker = Arc::new(Worker::new(
            queue.clone(),
            drivers,
            login,
            Arc::new(LandingPageExtractor),
            config.worker.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            config.scheduler.clone(),
            config.worker.auto_retry,
        ));

        Ok(Self::from_parts(queue, sessions, scheduler, worker, config))
    }

    pub fn from_parts(
        queue: Arc<TaskQueue>,
        sessions: Arc<SessionStore>,
        scheduler: Arc<Scheduler>,
        worker: Arc<Worker>,
        config: &Config,
    ) -> Self {
        Self {
            queue,
            sessions,
            scheduler,
            worker,
            scheduler_enabled: config.scheduler.enabled,
            session_cleanup_after: config.session.cleanup_after(),
        }
    }

    /// Prune old sessions, then start the worker and (if enabled) the scheduler.
    /// Safe to call twice.
    pub fn start(&self) {
        match self.sessions.cleanup_older_than(self.session_cleanup_after) {
            Ok(0) => {}
            Ok(n) => info!("Pruned {} old session snapshot(s)", n),
            Err(e) => warn!("Session cleanup failed: {}", e),
        }

        if !self.worker.is_running()
            && let Err(e) = self.queue.recover_interrupted()
        {
            warn!("Recovering interrupted tasks failed: {}", e);
        }

        self.worker.start();
        if self.scheduler_enabled {
            self.scheduler.start();
        }
    }

    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.worker.stop().await;
    }

    pub fn enqueue(&self, kind: TaskKind, params: Map<String, Value>) -> RpaResult<String> {
        self.queue.enqueue(kind, params)
    }

    pub fn task(&self, id: &str) -> RpaResult<Task> {
        self.queue.get(id)
    }

    pub fn recent(&self, limit: usize) -> RpaResult<Vec<TaskSummary>> {
        self.queue.list_recent(limit)
    }

    pub fn force_run(&self) -> RpaResult<String> {
        self.scheduler.force_run()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Latest extracted record
    pub fn latest_result(&self) -> RpaResult<Option<Value>> {
        self.queue.latest_result(TaskKind::AuthenticateAndExtract)
    }

    pub fn cancel(&self, id: &str) -> RpaResult<Task> {
        self.queue.cancel(id)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }
}
