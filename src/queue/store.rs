//! SQLite-backed task queue

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use super::task::{Task, TaskKind, TaskStatus, TaskSummary, TaskUpdate};
use crate::utils::constants::DEFAULT_MAX_RETRIES;
use crate::utils::errors::{RpaError, RpaResult};

const INTERRUPTED_ERROR: &str = "interrupted by shutdown";

const TASK_COLUMNS: &str = "id, kind, status, created_at, started_at, completed_at, \
     result, error, logs, retry_count, max_retries, params, not_before";

/// Durable FIFO of [`Task`]s
///
/// All access goes through one connection behind a mutex; the worker is the
/// only actor that moves a task past `Pending`.
pub struct TaskQueue {
    conn: Mutex<Connection>,
    default_max_retries: u32,
}

impl TaskQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> RpaResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RpaError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| RpaError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| RpaError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let queue = Self {
            conn: Mutex::new(conn),
            default_max_retries: DEFAULT_MAX_RETRIES,
        };
        queue.create_tables()?;

        info!("Opened task queue at {}", path.display());
        Ok(queue)
    }

    pub fn open_in_memory() -> RpaResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RpaError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        let queue = Self {
            conn: Mutex::new(conn),
            default_max_retries: DEFAULT_MAX_RETRIES,
        };
        queue.create_tables()?;
        Ok(queue)
    }

    /// Override the `max_retries` given to newly enqueued tasks
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    fn create_tables(&self) -> RpaResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rpa_tasks (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                result TEXT,
                error TEXT,
                logs TEXT NOT NULL DEFAULT '',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                params TEXT NOT NULL DEFAULT '{}',
                not_before TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_rpa_tasks_status ON rpa_tasks(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_rpa_tasks_kind ON rpa_tasks(kind, status);",
        )
        .map_err(|e| RpaError::Storage(format!("Failed to create tables: {}", e)))?;
        Ok(())
    }

    /// Insert a new `Pending` task and return its id
    pub fn enqueue(&self, kind: TaskKind, params: Map<String, Value>) -> RpaResult<String> {
        self.enqueue_with_max_retries(kind, params, self.default_max_retries)
    }

    pub fn enqueue_with_max_retries(
        &self,
        kind: TaskKind,
        params: Map<String, Value>,
        max_retries: u32,
    ) -> RpaResult<String> {
        let id = Uuid::now_v7().to_string();
        let created_at = now();
        let params_json = serde_json::to_string(&params)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rpa_tasks (id, kind, status, created_at, retry_count, max_retries, params)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                id,
                kind.as_str(),
                TaskStatus::Pending.as_str(),
                fmt_ts(&created_at),
                max_retries,
                params_json
            ],
        )?;

        info!(task_id = %id, kind = %kind, "Task enqueued");
        Ok(id)
    }

    pub fn get(&self, id: &str) -> RpaResult<Task> {
        let conn = self.conn.lock();
        load_task(&conn, id)
    }

    /// Oldest-first pending tasks that still have retries left
    pub fn list_pending(&self, limit: usize) -> RpaResult<Vec<Task>> {
        self.list_pending_at(limit, Utc::now())
    }

    /// [`list_pending`](Self::list_pending) with tasks backing off past `now` hidden
    pub fn list_pending_at(&self, limit: usize, now: DateTime<Utc>) -> RpaResult<Vec<Task>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM rpa_tasks
             WHERE status = ?1
               AND retry_count < max_retries
               AND (not_before IS NULL OR not_before <= ?2)
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![TaskStatus::Pending.as_str(), fmt_ts(&now), limit as i64],
            TaskRow::from_row,
        )?;

        rows.map(|row| row.map_err(RpaError::from).and_then(TaskRow::into_task))
            .collect()
    }

    /// Most recent first
    pub fn list_recent(&self, limit: usize) -> RpaResult<Vec<TaskSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, kind, status, created_at, started_at, completed_at, retry_count,
                    error IS NOT NULL
             FROM rpa_tasks
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, u32>(6)?,
                row.get::<_, bool>(7)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, kind, status, created_at, started_at, completed_at, retry_count, has_error) =
                row?;
            summaries.push(TaskSummary {
                id,
                kind: kind.parse()?,
                status: status.parse()?,
                created_at: parse_ts(&created_at)?,
                started_at: parse_opt_ts(started_at)?,
                completed_at: parse_opt_ts(completed_at)?,
                retry_count,
                has_error,
            });
        }
        Ok(summaries)
    }

    /// Apply a partial update, enforcing the status lifecycle
    pub fn update(&self, id: &str, update: TaskUpdate) -> RpaResult<Task> {
        self.modify(id, |_| Ok(update))
    }

    /// Result payload of the newest completed task of `kind`
    pub fn latest_result(&self, kind: TaskKind) -> RpaResult<Option<Value>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT result FROM rpa_tasks
                 WHERE kind = ?1 AND status = ?2 AND result IS NOT NULL
                 ORDER BY completed_at DESC, rowid DESC
                 LIMIT 1",
                params![kind.as_str(), TaskStatus::Completed.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        raw.map(|s| serde_json::from_str(&s).map_err(RpaError::from))
            .transpose()
    }

    /// `Pending -> Cancelled`
    pub fn cancel(&self, id: &str) -> RpaResult<Task> {
        let task = self.update(
            id,
            TaskUpdate::default()
                .status(TaskStatus::Cancelled)
                .completed_at(now()),
        )?;
        info!(task_id = %id, "Task cancelled");
        Ok(task)
    }

    /// `Pending -> Running`, stamping `started_at`
    pub fn mark_running(&self, id: &str) -> RpaResult<Task> {
        self.update(
            id,
            TaskUpdate::default()
                .status(TaskStatus::Running)
                .started_at(now())
                .not_before(None),
        )
    }

    pub fn complete(&self, id: &str, result: Value, log: impl Into<String>) -> RpaResult<Task> {
        self.update(
            id,
            TaskUpdate::default()
                .status(TaskStatus::Completed)
                .completed_at(now())
                .result(result)
                .log(log),
        )
    }

    /// `Running -> Failed`; bumps `retry_count`
    pub fn fail(&self, id: &str, error: impl Into<String>, log: impl Into<String>) -> RpaResult<Task> {
        let error = error.into();
        let log = log.into();
        self.modify(id, |task| {
            Ok(TaskUpdate::default()
                .status(TaskStatus::Failed)
                .completed_at(now())
                .error(error)
                .log(log)
                .retry_count(task.retry_count + 1))
        })
    }

    /// `Running -> Pending` for an automatic retry, hidden until `not_before`
    pub fn requeue(
        &self,
        id: &str,
        error: impl Into<String>,
        log: impl Into<String>,
        not_before: DateTime<Utc>,
    ) -> RpaResult<Task> {
        let error = error.into();
        let log = log.into();
        self.modify(id, |task| {
            Ok(TaskUpdate::default()
                .status(TaskStatus::Pending)
                .error(error)
                .log(log)
                .retry_count(task.retry_count + 1)
                .not_before(Some(not_before.trunc_subsecs(6))))
        })
    }

    /// Fail every task left `Running` by a previous process. Call before the
    /// worker starts; returns how many were recovered.
    pub fn recover_interrupted(&self) -> RpaResult<usize> {
        let note = format!(
            "[{}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            INTERRUPTED_ERROR
        );
        let conn = self.conn.lock();
        let recovered = conn.execute(
            "UPDATE rpa_tasks
             SET status = ?1,
                 error = ?2,
                 completed_at = ?3,
                 retry_count = retry_count + 1,
                 logs = CASE WHEN logs = '' THEN ?4 ELSE logs || char(10) || ?4 END
             WHERE status = ?5",
            params![
                TaskStatus::Failed.as_str(),
                INTERRUPTED_ERROR,
                fmt_ts(&now()),
                note,
                TaskStatus::Running.as_str()
            ],
        )?;

        if recovered > 0 {
            info!("Marked {} interrupted task(s) as failed", recovered);
        }
        Ok(recovered)
    }

    /// Read, validate and rewrite one task under a single lock
    fn modify<F>(&self, id: &str, build: F) -> RpaResult<Task>
    where
        F: FnOnce(&Task) -> RpaResult<TaskUpdate>,
    {
        let conn = self.conn.lock();
        let mut task = load_task(&conn, id)?;
        let update = build(&task)?;

        if update.is_empty() {
            return Ok(task);
        }

        if let Some(next) = update.status {
            if !task.status.can_transition_to(next) {
                return Err(RpaError::InvalidTransition {
                    id: id.to_string(),
                    from: task.status.to_string(),
                    to: next.to_string(),
                });
            }
            debug!(task_id = %id, "Task {} -> {}", task.status, next);
            task.status = next;
        }

        if let Some(at) = update.started_at {
            task.started_at = Some(at.trunc_subsecs(6));
        }
        if let Some(at) = update.completed_at {
            task.completed_at = Some(at.trunc_subsecs(6));
        }
        if let Some(result) = update.result {
            task.result = Some(result);
        }
        if let Some(error) = update.error {
            task.error = Some(error);
        }
        if let Some(log) = update.log {
            task.log = log;
        }
        if let Some(count) = update.retry_count {
            task.retry_count = count;
        }
        if let Some(not_before) = update.not_before {
            task.not_before = not_before;
        }

        let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            "UPDATE rpa_tasks
             SET status = ?2, started_at = ?3, completed_at = ?4, result = ?5,
                 error = ?6, logs = ?7, retry_count = ?8, not_before = ?9
             WHERE id = ?1",
            params![
                id,
                task.status.as_str(),
                task.started_at.as_ref().map(fmt_ts),
                task.completed_at.as_ref().map(fmt_ts),
                result_json,
                task.error,
                task.log,
                task.retry_count,
                task.not_before.as_ref().map(fmt_ts),
            ],
        )?;

        Ok(task)
    }
}

fn load_task(conn: &Connection, id: &str) -> RpaResult<Task> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM rpa_tasks WHERE id = ?1"),
        params![id],
        TaskRow::from_row,
    )
    .optional()?
    .ok_or_else(|| RpaError::NotFound(format!("task '{}'", id)))?
    .into_task()
}

/// Raw column values, decoded outside the rusqlite row callback
struct TaskRow {
    id: String,
    kind: String,
    status: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result: Option<String>,
    error: Option<String>,
    logs: String,
    retry_count: u32,
    max_retries: u32,
    params: String,
    not_before: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            status: row.get(2)?,
            created_at: row.get(3)?,
            started_at: row.get(4)?,
            completed_at: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
            logs: row.get(8)?,
            retry_count: row.get(9)?,
            max_retries: row.get(10)?,
            params: row.get(11)?,
            not_before: row.get(12)?,
        })
    }

    fn into_task(self) -> RpaResult<Task> {
        Ok(Task {
            kind: self.kind.parse()?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            started_at: parse_opt_ts(self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            result: self
                .result
                .map(|s| serde_json::from_str(&s))
                .transpose()?,
            error: self.error,
            log: self.logs,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            params: serde_json::from_str(&self.params)?,
            not_before: parse_opt_ts(self.not_before)?,
            id: self.id,
        })
    }
}

/// Wall clock at the precision the store keeps
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so lexical order in SQL equals time order
fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> RpaResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RpaError::Serialization(format!("Bad timestamp '{}': {}", raw, e)))
}

fn parse_opt_ts(raw: Option<String>) -> RpaResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params_of(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn enqueue_then_get_returns_pending_task() {
        let queue = TaskQueue::open_in_memory().unwrap();
        let id = queue
            .enqueue(TaskKind::AuthenticateOnly, params_of(json!({"forced": true})))
            .unwrap();

        let task = queue.get(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, 3);
        assert!(task.param_bool("forced"));
        assert!(task.started_at.is_none());
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let queue = TaskQueue::open_in_memory().unwrap();
        assert!(matches!(queue.get("missing"), Err(RpaError::NotFound(_))));
    }

    #[test]
    fn pending_listing_skips_exhausted_and_backing_off_tasks() {
        let queue = TaskQueue::open_in_memory().unwrap();
        let exhausted = queue
            .enqueue_with_max_retries(TaskKind::AuthenticateOnly, Map::new(), 0)
            .unwrap();
        let later = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
        queue.mark_running(&later).unwrap();
        let resume_at = Utc::now() + chrono::Duration::minutes(5);
        queue.requeue(&later, "boom", "", resume_at).unwrap();
        let ready = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();

        let ids: Vec<_> = queue.list_pending(10).unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![ready.clone()]);
        assert!(!ids.contains(&exhausted));

        let after = resume_at + chrono::Duration::seconds(1);
        let ids: Vec<_> = queue
            .list_pending_at(10, after)
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![later, ready]);
    }

    #[test]
    fn fail_increments_retry_count_and_stays_terminal() {
        let queue = TaskQueue::open_in_memory().unwrap();
        let id = queue.enqueue(TaskKind::AuthenticateAndExtract, Map::new()).unwrap();
        queue.mark_running(&id).unwrap();
        let failed = queue.fail(&id, "verification timeout", "[00:00:00] tried").unwrap();

        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.completed_at.is_some());

        let err = queue
            .update(&id, TaskUpdate::default().status(TaskStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, RpaError::InvalidTransition { .. }));
        assert_eq!(queue.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn cancel_only_applies_to_pending_tasks() {
        let queue = TaskQueue::open_in_memory().unwrap();
        let pending = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
        let running = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
        queue.mark_running(&running).unwrap();

        assert_eq!(queue.cancel(&pending).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(
            queue.cancel(&running),
            Err(RpaError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn latest_result_picks_newest_completed_task_of_kind() {
        let queue = TaskQueue::open_in_memory().unwrap();
        assert!(queue.latest_result(TaskKind::AuthenticateAndExtract).unwrap().is_none());

        for n in 1..=2 {
            let id = queue.enqueue(TaskKind::AuthenticateAndExtract, Map::new()).unwrap();
            queue.mark_running(&id).unwrap();
            queue.complete(&id, json!({"run": n}), "").unwrap();
        }
        let other = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
        queue.mark_running(&other).unwrap();
        queue.complete(&other, json!({"run": 99}), "").unwrap();

        assert_eq!(
            queue.latest_result(TaskKind::AuthenticateAndExtract).unwrap(),
            Some(json!({"run": 2}))
        );
    }

    #[test]
    fn recent_listing_is_newest_first_with_error_flag() {
        let queue = TaskQueue::open_in_memory().unwrap();
        let first = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
        let second = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
        queue.mark_running(&first).unwrap();
        queue.fail(&first, "boom", "").unwrap();

        let recent = queue.list_recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, second);
        assert!(!recent[0].has_error);
        assert_eq!(recent[1].id, first);
        assert!(recent[1].has_error);
    }

    #[test]
    fn interrupted_running_tasks_fail_on_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let (running, pending) = {
            let queue = TaskQueue::open(&path).unwrap();
            let running = queue.enqueue(TaskKind::AuthenticateAndExtract, Map::new()).unwrap();
            let pending = queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap();
            queue.mark_running(&running).unwrap();
            queue
                .update(&running, TaskUpdate::default().log("[10:00:00] login: FullLogin"))
                .unwrap();
            (running, pending)
        };

        let queue = TaskQueue::open(&path).unwrap();
        assert_eq!(queue.recover_interrupted().unwrap(), 1);

        let task = queue.get(&running).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error.as_deref(), Some("interrupted by shutdown"));
        assert!(task.completed_at.is_some());
        assert!(task.log.starts_with("[10:00:00] login: FullLogin\n"));
        assert!(task.log.ends_with("interrupted by shutdown"));
        assert_eq!(queue.get(&pending).unwrap().status, TaskStatus::Pending);

        assert_eq!(queue.recover_interrupted().unwrap(), 0);
    }

    #[test]
    fn tasks_survive_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let id = {
            let queue = TaskQueue::open(&path).unwrap();
            queue.enqueue(TaskKind::AuthenticateOnly, Map::new()).unwrap()
        };
        let queue = TaskQueue::open(&path).unwrap();
        assert_eq!(queue.get(&id).unwrap().status, TaskStatus::Pending);
    }
}
