//! The embedded, single-file [`Backend`], backed by SQLite.
//!
//! Atomicity is realized by a single writer: the pool is capped at one
//! connection, so every transaction already serializes with every other
//! one. This backend assumes single-process access; multi-process worker
//! pools need [`super::postgres::PostgresBackend`].

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{Backend, TaskPatch};
use crate::error::StoreError;
use crate::model::{Execution, ExecutionState, Progress, ProgressStatus, Task, TaskKind, TaskState};
use crate::outcome::Outcome;

/// Embedded SQLite-backed store. Opens (and creates, if absent) a single
/// database file at the given path.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Connect to `path`, creating the file if it doesn't exist. Caps the
    /// pool at a single connection so every transaction serializes.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn state_str(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Pending => "pending",
        ExecutionState::Running => "running",
        ExecutionState::Completed => "completed",
        ExecutionState::Failed => "failed",
        ExecutionState::TimedOut => "timed_out",
        ExecutionState::Cancelled => "cancelled",
    }
}

fn parse_execution_state(s: &str) -> Result<ExecutionState, StoreError> {
    Ok(match s {
        "pending" => ExecutionState::Pending,
        "running" => ExecutionState::Running,
        "completed" => ExecutionState::Completed,
        "failed" => ExecutionState::Failed,
        "timed_out" => ExecutionState::TimedOut,
        "cancelled" => ExecutionState::Cancelled,
        other => return Err(StoreError::Database(format!("unknown execution state: {other}"))),
    })
}

fn task_state_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Ready => "ready",
        TaskState::Running => "running",
        TaskState::Completed => "completed",
        TaskState::Failed => "failed",
        TaskState::WaitingChildren => "waiting_children",
        TaskState::ScheduledRetry => "scheduled_retry",
    }
}

fn parse_task_state(s: &str) -> Result<TaskState, StoreError> {
    Ok(match s {
        "ready" => TaskState::Ready,
        "running" => TaskState::Running,
        "completed" => TaskState::Completed,
        "failed" => TaskState::Failed,
        "waiting_children" => TaskState::WaitingChildren,
        "scheduled_retry" => TaskState::ScheduledRetry,
        other => return Err(StoreError::Database(format!("unknown task state: {other}"))),
    })
}

fn task_kind_str(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Orchestrator => "orchestrator",
        TaskKind::Activity => "activity",
    }
}

fn parse_task_kind(s: &str) -> Result<TaskKind, StoreError> {
    Ok(match s {
        "orchestrator" => TaskKind::Orchestrator,
        "activity" => TaskKind::Activity,
        other => return Err(StoreError::Database(format!("unknown task kind: {other}"))),
    })
}

fn progress_status_str(status: ProgressStatus) -> &'static str {
    match status {
        ProgressStatus::Started => "started",
        ProgressStatus::Completed => "completed",
        ProgressStatus::Failed => "failed",
        ProgressStatus::Retrying => "retrying",
    }
}

fn parse_progress_status(s: &str) -> Result<ProgressStatus, StoreError> {
    Ok(match s {
        "started" => ProgressStatus::Started,
        "completed" => ProgressStatus::Completed,
        "failed" => ProgressStatus::Failed,
        "retrying" => ProgressStatus::Retrying,
        other => return Err(StoreError::Database(format!("unknown progress status: {other}"))),
    })
}

fn tags_to_json(tags: &HashSet<String>) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(s: &str) -> HashSet<String> {
    serde_json::from_str(s).unwrap_or_default()
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<Execution, StoreError> {
    let id: String = row.get("id");
    let args: String = row.get("args");
    let state: String = row.get("state");
    let result: Option<String> = row.get("result");
    let tags: String = row.get("tags");

    Ok(Execution {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Database(e.to_string()))?,
        procedure_name: row.get("procedure_name"),
        args: serde_json::from_str(&args).map_err(|e| StoreError::Serialization(e.to_string()))?,
        state: parse_execution_state(&state)?,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        queue: row.get("queue"),
        tags: tags_from_json(&tags),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
    let id: String = row.get("id");
    let execution_id: String = row.get("execution_id");
    let parent_task_id: Option<String> = row.get("parent_task_id");
    let kind: String = row.get("kind");
    let args: String = row.get("args");
    let state: String = row.get("state");
    let retry_policy: String = row.get("retry_policy");
    let tags: String = row.get("tags");
    let result: Option<String> = row.get("result");
    let children: String = row.get("children");

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::Database(e.to_string()))?,
        execution_id: Uuid::parse_str(&execution_id).map_err(|e| StoreError::Database(e.to_string()))?,
        parent_task_id: parent_task_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?,
        kind: parse_task_kind(&kind)?,
        procedure_name: row.get("procedure_name"),
        step_name: row.get("step_name"),
        step_index: row.get::<i64, _>("step_index") as u32,
        args: serde_json::from_str(&args).map_err(|e| StoreError::Serialization(e.to_string()))?,
        state: parse_task_state(&state)?,
        retries: row.get::<i64, _>("retries") as u32,
        retry_policy: serde_json::from_str(&retry_policy).map_err(|e| StoreError::Serialization(e.to_string()))?,
        next_attempt_at: row.get("next_attempt_at"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        queue: row.get("queue"),
        tags: tags_from_json(&tags),
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: row.get("error"),
        children: tags_from_json(&children)
            .into_iter()
            .map(|s| Uuid::parse_str(&s))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|e| StoreError::Database(e.to_string()))?,
    })
}

fn ids_to_json(ids: &HashSet<Uuid>) -> String {
    let strs: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    serde_json::to_string(&strs).unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl Backend for SqliteBackend {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                procedure_name TEXT NOT NULL,
                args TEXT NOT NULL,
                state TEXT NOT NULL,
                result TEXT,
                queue TEXT NOT NULL,
                tags TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                parent_task_id TEXT,
                kind TEXT NOT NULL,
                procedure_name TEXT NOT NULL,
                step_name TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                args TEXT NOT NULL,
                state TEXT NOT NULL,
                retries INTEGER NOT NULL,
                retry_policy TEXT NOT NULL,
                next_attempt_at TEXT NOT NULL,
                lease_owner TEXT,
                lease_expires_at TEXT,
                queue TEXT NOT NULL,
                tags TEXT NOT NULL,
                result TEXT,
                error TEXT,
                children TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(state, next_attempt_at, queue)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_execution ON tasks(execution_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS progress (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                detail TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_progress_execution ON progress(execution_id, id)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        debug!("sqlite schema ready");
        Ok(())
    }

    #[instrument(skip(self, execution, root_task))]
    async fn insert_execution(&self, execution: &Execution, root_task: &Task) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO executions (id, procedure_name, args, state, result, queue, tags, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(execution.id.to_string())
        .bind(&execution.procedure_name)
        .bind(serde_json::to_string(&execution.args).map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(state_str(execution.state))
        .bind(None::<String>)
        .bind(&execution.queue)
        .bind(tags_to_json(&execution.tags))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        insert_task_row(&mut tx, root_task).await?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, queues, tags))]
    async fn claim_next(
        &self,
        queues: &[String],
        tags: &HashSet<String>,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        // SQLite has no SELECT ... FOR UPDATE SKIP LOCKED; the single-writer
        // pool already serializes this transaction against every other one,
        // so a plain scan-then-update is race-free.
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE state IN ('ready', 'scheduled_retry')
              AND next_attempt_at <= ?
              AND (lease_owner IS NULL OR lease_expires_at < ?)
            ORDER BY next_attempt_at
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut chosen: Option<Task> = None;
        for row in &rows {
            let task = row_to_task(row)?;
            let queue_ok = queues.is_empty() || queues.contains(&task.queue);
            let tags_ok = tags.is_empty() || !task.tags.is_disjoint(tags);
            if queue_ok && tags_ok {
                chosen = Some(task);
                break;
            }
        }

        let Some(mut task) = chosen else {
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            return Ok(None);
        };

        let lease_expires_at = now + lease_duration;
        sqlx::query("UPDATE tasks SET state = 'running', lease_owner = ?, lease_expires_at = ? WHERE id = ?")
            .bind(worker_id)
            .bind(lease_expires_at)
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if task.parent_task_id.is_none() {
            sqlx::query(
                "UPDATE executions SET state = 'running', started_at = COALESCE(started_at, ?) WHERE id = ? AND state = 'pending'",
            )
            .bind(now)
            .bind(task.execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;

        task.state = TaskState::Running;
        task.lease_owner = Some(worker_id.to_string());
        task.lease_expires_at = Some(lease_expires_at);
        Ok(Some(task))
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET lease_expires_at = ? WHERE id = ? AND lease_owner = ?")
            .bind(lease_expires_at)
            .bind(task_id.to_string())
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeaseLost(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self, patch))]
    async fn checkpoint_task(&self, task_id: Uuid, worker_id: &str, patch: TaskPatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let task = row_to_task(&row)?;

        if task.lease_owner.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost(task_id));
        }

        // A child can reach a terminal state and call `on_child_terminal`
        // before this checkpoint lands, since the pending set handed back
        // by a suspended body reflects a snapshot taken before any of its
        // sub-dispatches, not the children's state right now. Re-check each
        // one here so an already-terminal child isn't written back into
        // `children`, where nothing would ever wake it again; if none are
        // left outstanding, reopen immediately instead of suspending.
        let patch = if let TaskPatch::WaitingChildren { children } = patch {
            let mut still_pending = HashSet::new();
            for child_id in children {
                let terminal = sqlx::query("SELECT state FROM tasks WHERE id = ?")
                    .bind(child_id.to_string())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Database(e.to_string()))?
                    .map(|r| {
                        let state: String = r.get("state");
                        parse_task_state(&state)
                    })
                    .transpose()?
                    .map(|s| s.is_terminal())
                    .unwrap_or(false);
                if !terminal {
                    still_pending.insert(child_id);
                }
            }
            TaskPatch::WaitingChildren { children: still_pending }
        } else {
            patch
        };

        let (new_state, retries, next_attempt_at, result, error, children) = match patch {
            TaskPatch::WaitingChildren { children } if children.is_empty() => {
                (TaskState::Ready, task.retries, Utc::now(), task.result.clone(), task.error.clone(), Some(HashSet::new()))
            }
            TaskPatch::WaitingChildren { children } => (
                TaskState::WaitingChildren,
                task.retries,
                task.next_attempt_at,
                task.result.clone(),
                task.error.clone(),
                Some(children),
            ),
            TaskPatch::Completed { result } => {
                (TaskState::Completed, task.retries, task.next_attempt_at, Some(result), None, None)
            }
            TaskPatch::Failed { result, error } => (
                TaskState::Failed,
                task.retries,
                task.next_attempt_at,
                Some(result),
                Some(error),
                None,
            ),
            TaskPatch::ScheduledRetry {
                retries,
                next_attempt_at,
                error,
            } => (TaskState::ScheduledRetry, retries, next_attempt_at, task.result.clone(), Some(error), None),
            TaskPatch::Released { next_attempt_at } => {
                (TaskState::Ready, task.retries, next_attempt_at, task.result.clone(), task.error.clone(), None)
            }
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET state = ?, retries = ?, next_attempt_at = ?, result = ?, error = ?, children = ?,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(task_state_str(new_state))
        .bind(retries)
        .bind(next_attempt_at)
        .bind(result.as_ref().map(serde_json::to_string).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?)
        .bind(error)
        .bind(ids_to_json(&children.unwrap_or_else(|| task.children.clone())))
        .bind(task_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if task.parent_task_id.is_none() && matches!(new_state, TaskState::Completed | TaskState::Failed) {
            sqlx::query("UPDATE executions SET state = ?, result = ?, completed_at = ? WHERE id = ?")
                .bind(if new_state == TaskState::Completed { "completed" } else { "failed" })
                .bind(result.as_ref().map(serde_json::to_string).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?)
                .bind(Utc::now())
                .bind(task.execution_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, record))]
    async fn append_progress(&self, record: Progress) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO progress (execution_id, step, status, started_at, completed_at, detail)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.execution_id.to_string())
        .bind(&record.step)
        .bind(progress_status_str(record.status))
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.detail)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, child))]
    async fn insert_child_task(&self, parent_task_id: Uuid, child: Task) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT children FROM tasks WHERE id = ?")
            .bind(parent_task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(parent_task_id))?;

        let children_json: String = row.get("children");
        let mut children: HashSet<Uuid> = tags_from_json(&children_json)
            .into_iter()
            .map(|s| Uuid::parse_str(&s))
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        children.insert(child.id);

        sqlx::query("UPDATE tasks SET children = ? WHERE id = ?")
            .bind(ids_to_json(&children))
            .bind(parent_task_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        insert_task_row(&mut tx, &child).await?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn on_child_terminal(&self, child_task_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT parent_task_id FROM tasks WHERE id = ?")
            .bind(child_task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(child_task_id))?;

        let parent_task_id: Option<String> = row.get("parent_task_id");
        let Some(parent_task_id) = parent_task_id else {
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            return Ok(());
        };

        let parent_row = sqlx::query("SELECT children, state FROM tasks WHERE id = ?")
            .bind(&parent_task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::Database("parent task vanished mid-transaction".to_string()))?;

        let children_json: String = parent_row.get("children");
        let parent_state: String = parent_row.get("state");
        let mut children: HashSet<Uuid> = tags_from_json(&children_json)
            .into_iter()
            .map(|s| Uuid::parse_str(&s))
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        children.remove(&child_task_id);

        if children.is_empty() && parse_task_state(&parent_state)? == TaskState::WaitingChildren {
            sqlx::query(
                "UPDATE tasks SET children = ?, state = 'ready', next_attempt_at = ?, lease_owner = NULL, lease_expires_at = NULL WHERE id = ?",
            )
            .bind(ids_to_json(&children))
            .bind(Utc::now())
            .bind(&parent_task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        } else {
            sqlx::query("UPDATE tasks SET children = ? WHERE id = ?")
                .bind(ids_to_json(&children))
                .bind(&parent_task_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(id))?;
        row_to_execution(&row)
    }

    #[instrument(skip(self))]
    async fn list_executions(&self, limit: usize, state_filter: Option<ExecutionState>) -> Result<Vec<Execution>, StoreError> {
        let rows = match state_filter {
            Some(state) => sqlx::query("SELECT * FROM executions WHERE state = ? ORDER BY started_at LIMIT ?")
                .bind(state_str(state))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM executions ORDER BY started_at LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn list_tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE execution_id = ?")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn list_progress_for_execution(&self, execution_id: Uuid) -> Result<Vec<Progress>, StoreError> {
        let rows = sqlx::query("SELECT * FROM progress WHERE execution_id = ? ORDER BY id")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(Progress {
                    execution_id,
                    step: row.get("step"),
                    status: parse_progress_status(&status)?,
                    started_at: row.get("started_at"),
                    completed_at: row.get("completed_at"),
                    detail: row.get("detail"),
                })
            })
            .collect()
    }
}

async fn insert_task_row(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, task: &Task) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, execution_id, parent_task_id, kind, procedure_name, step_name, step_index, args, state,
            retries, retry_policy, next_attempt_at, lease_owner, lease_expires_at,
            queue, tags, result, error, children
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(task.id.to_string())
    .bind(task.execution_id.to_string())
    .bind(task.parent_task_id.map(|id| id.to_string()))
    .bind(task_kind_str(task.kind))
    .bind(&task.procedure_name)
    .bind(&task.step_name)
    .bind(task.step_index as i64)
    .bind(serde_json::to_string(&task.args).map_err(|e| StoreError::Serialization(e.to_string()))?)
    .bind(task_state_str(task.state))
    .bind(task.retries as i64)
    .bind(serde_json::to_string(&task.retry_policy).map_err(|e| StoreError::Serialization(e.to_string()))?)
    .bind(task.next_attempt_at)
    .bind(&task.lease_owner)
    .bind(task.lease_expires_at)
    .bind(&task.queue)
    .bind(tags_to_json(&task.tags))
    .bind(task.result.as_ref().map(serde_json::to_string).transpose().map_err(|e| StoreError::Serialization(e.to_string()))?)
    .bind(&task.error)
    .bind(ids_to_json(&task.children))
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::collections::HashSet as Set;

    async fn temp_backend() -> (SqliteBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sqlite");
        let backend = SqliteBackend::connect(path.to_str().unwrap()).await.unwrap();
        backend.init().await.unwrap();
        (backend, dir)
    }

    #[test_log::test(tokio::test)]
    async fn init_is_idempotent() {
        let (backend, _dir) = temp_backend().await;
        backend.init().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn insert_and_fetch_execution_round_trips() {
        let (backend, _dir) = temp_backend().await;
        let execution = Execution::new("simple_task", serde_json::json!([21]), "default", Set::new());
        let root = Task::root_orchestrator(&execution, RetryPolicy::no_retry());
        backend.insert_execution(&execution, &root).await.unwrap();

        let fetched = backend.get_execution(execution.id).await.unwrap();
        assert_eq!(fetched.procedure_name, "simple_task");
        assert_eq!(fetched.args, serde_json::json!([21]));

        let tasks = backend.list_tasks_for_execution(execution.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].step_name, "root");
    }

    #[test_log::test(tokio::test)]
    async fn claim_and_complete_updates_execution_state() {
        let (backend, _dir) = temp_backend().await;
        let execution = Execution::new("simple_task", serde_json::json!([21]), "default", Set::new());
        let root = Task::root_orchestrator(&execution, RetryPolicy::no_retry());
        backend.insert_execution(&execution, &root).await.unwrap();

        let claimed = backend
            .claim_next(&[], &Set::new(), "worker-1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, root.id);

        backend
            .checkpoint_task(root.id, "worker-1", TaskPatch::Completed { result: Outcome::ok(42) })
            .await
            .unwrap();

        let execution = backend.get_execution(execution.id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Completed);
        assert_eq!(execution.result, Some(Outcome::ok(42)));
    }

    #[test_log::test(tokio::test)]
    async fn progress_records_are_listed_in_order() {
        let (backend, _dir) = temp_backend().await;
        let execution = Execution::new("wf", serde_json::json!([]), "default", Set::new());
        let root = Task::root_orchestrator(&execution, RetryPolicy::no_retry());
        backend.insert_execution(&execution, &root).await.unwrap();

        for status in [ProgressStatus::Started, ProgressStatus::Completed] {
            backend
                .append_progress(Progress {
                    execution_id: execution.id,
                    step: "root".to_string(),
                    status,
                    started_at: Some(Utc::now()),
                    completed_at: None,
                    detail: None,
                })
                .await
                .unwrap();
        }

        let progress = backend.list_progress_for_execution(execution.id).await.unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[0].status, ProgressStatus::Started);
        assert_eq!(progress[1].status, ProgressStatus::Completed);
    }
}
