//! The networked [`Backend`], backed by PostgreSQL.
//!
//! Built for many concurrent worker processes claiming from the same task
//! table: `claim_next` selects and locks its candidate with a single
//! `SELECT ... FOR UPDATE SKIP LOCKED` CTE feeding an `UPDATE ... FROM`, so
//! two workers racing for the same row never block on one another — the
//! loser simply sees zero candidate rows and moves on.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::{Backend, TaskPatch};
use crate::error::StoreError;
use crate::model::{Execution, ExecutionState, Progress, ProgressStatus, Task, TaskKind, TaskState};
use crate::outcome::Outcome;

/// Networked Postgres-backed store, suitable for a worker pool spread
/// across many processes or machines.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
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

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<Execution, StoreError> {
    let state: String = row.get("state");
    let result: Option<serde_json::Value> = row.get("result");
    let tags: Vec<String> = row.get("tags");

    Ok(Execution {
        id: row.get("id"),
        procedure_name: row.get("procedure_name"),
        args: row.get("args"),
        state: parse_execution_state(&state)?,
        result: result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        queue: row.get("queue"),
        tags: tags.into_iter().collect(),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> Result<Task, StoreError> {
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let tags: Vec<String> = row.get("tags");
    let children: Vec<Uuid> = row.get("children");
    let result: Option<serde_json::Value> = row.get("result");
    let retry_policy: serde_json::Value = row.get("retry_policy");

    Ok(Task {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        parent_task_id: row.get("parent_task_id"),
        kind: parse_task_kind(&kind)?,
        procedure_name: row.get("procedure_name"),
        step_name: row.get("step_name"),
        step_index: row.get::<i64, _>("step_index") as u32,
        args: row.get("args"),
        state: parse_task_state(&state)?,
        retries: row.get::<i64, _>("retries") as u32,
        retry_policy: serde_json::from_value(retry_policy).map_err(|e| StoreError::Serialization(e.to_string()))?,
        next_attempt_at: row.get("next_attempt_at"),
        lease_owner: row.get("lease_owner"),
        lease_expires_at: row.get("lease_expires_at"),
        queue: row.get("queue"),
        tags: tags.into_iter().collect(),
        result: result
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        error: row.get("error"),
        children: children.into_iter().collect(),
    })
}

#[async_trait]
impl Backend for PostgresBackend {
    #[instrument(skip(self))]
    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id UUID PRIMARY KEY,
                procedure_name TEXT NOT NULL,
                args JSONB NOT NULL,
                state TEXT NOT NULL,
                result JSONB,
                queue TEXT NOT NULL,
                tags TEXT[] NOT NULL DEFAULT '{}',
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id UUID PRIMARY KEY,
                execution_id UUID NOT NULL REFERENCES executions(id),
                parent_task_id UUID,
                kind TEXT NOT NULL,
                procedure_name TEXT NOT NULL,
                step_name TEXT NOT NULL,
                step_index BIGINT NOT NULL,
                args JSONB NOT NULL,
                state TEXT NOT NULL,
                retries BIGINT NOT NULL,
                retry_policy JSONB NOT NULL,
                next_attempt_at TIMESTAMPTZ NOT NULL,
                lease_owner TEXT,
                lease_expires_at TIMESTAMPTZ,
                queue TEXT NOT NULL,
                tags TEXT[] NOT NULL DEFAULT '{}',
                result JSONB,
                error TEXT,
                children UUID[] NOT NULL DEFAULT '{}'
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
                id BIGSERIAL PRIMARY KEY,
                execution_id UUID NOT NULL,
                step TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
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

        debug!("postgres schema ready");
        Ok(())
    }

    #[instrument(skip(self, execution, root_task))]
    async fn insert_execution(&self, execution: &Execution, root_task: &Task) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let tags: Vec<String> = execution.tags.iter().cloned().collect();
        sqlx::query(
            r#"
            INSERT INTO executions (id, procedure_name, args, state, result, queue, tags, started_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(execution.id)
        .bind(&execution.procedure_name)
        .bind(&execution.args)
        .bind(state_str(execution.state))
        .bind(None::<serde_json::Value>)
        .bind(&execution.queue)
        .bind(&tags)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to insert execution: {e}");
            StoreError::Database(e.to_string())
        })?;

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
        let queues_filter: Vec<String> = queues.to_vec();
        let tags_filter: Vec<String> = tags.iter().cloned().collect();
        let lease_expires_at = now + lease_duration;

        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM tasks
                WHERE state IN ('ready', 'scheduled_retry')
                  AND next_attempt_at <= $1
                  AND (lease_owner IS NULL OR lease_expires_at < $1)
                  AND ($2::text[] = '{}' OR queue = ANY($2))
                  AND ($3::text[] = '{}' OR tags && $3)
                ORDER BY next_attempt_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks t
            SET state = 'running', lease_owner = $4, lease_expires_at = $5
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.*
            "#,
        )
        .bind(now)
        .bind(&queues_filter)
        .bind(&tags_filter)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to claim task: {e}");
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let task = row_to_task(&row)?;

        if task.parent_task_id.is_none() {
            sqlx::query(
                "UPDATE executions SET state = 'running', started_at = COALESCE(started_at, $1) WHERE id = $2 AND state = 'pending'",
            )
            .bind(now)
            .bind(task.execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        debug!(task_id = %task.id, worker_id, "claimed task");
        Ok(Some(task))
    }

    #[instrument(skip(self))]
    async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET lease_expires_at = $1 WHERE id = $2 AND lease_owner = $3")
            .bind(lease_expires_at)
            .bind(task_id)
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

        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(task_id)
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
        // one here, under the same row locks, so an already-terminal child
        // isn't written back into `children`, where nothing would ever wake
        // it again; if none are left outstanding, reopen immediately
        // instead of suspending.
        let patch = if let TaskPatch::WaitingChildren { children } = patch {
            let ids: Vec<Uuid> = children.iter().copied().collect();
            let terminal_ids: HashSet<Uuid> = sqlx::query_scalar(
                "SELECT id FROM tasks WHERE id = ANY($1) AND state IN ('completed', 'failed') FOR UPDATE",
            )
            .bind(&ids)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .into_iter()
            .collect();
            let still_pending: HashSet<Uuid> =
                children.into_iter().filter(|id| !terminal_ids.contains(id)).collect();
            TaskPatch::WaitingChildren { children: still_pending }
        } else {
            patch
        };

        let (new_state, retries, next_attempt_at, result, error, children) = match patch {
            TaskPatch::WaitingChildren { children } if children.is_empty() => (
                TaskState::Ready,
                task.retries,
                Utc::now(),
                task.result.clone(),
                task.error.clone(),
                HashSet::new(),
            ),
            TaskPatch::WaitingChildren { children } => (
                TaskState::WaitingChildren,
                task.retries,
                task.next_attempt_at,
                task.result.clone(),
                task.error.clone(),
                children,
            ),
            TaskPatch::Completed { result } => {
                (TaskState::Completed, task.retries, task.next_attempt_at, Some(result), None, task.children.clone())
            }
            TaskPatch::Failed { result, error } => (
                TaskState::Failed,
                task.retries,
                task.next_attempt_at,
                Some(result),
                Some(error),
                task.children.clone(),
            ),
            TaskPatch::ScheduledRetry {
                retries,
                next_attempt_at,
                error,
            } => (TaskState::ScheduledRetry, retries, next_attempt_at, task.result.clone(), Some(error), task.children.clone()),
            TaskPatch::Released { next_attempt_at } => {
                (TaskState::Ready, task.retries, next_attempt_at, task.result.clone(), task.error.clone(), task.children.clone())
            }
        };

        let result_json = result
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let children_vec: Vec<Uuid> = children.into_iter().collect();

        sqlx::query(
            r#"
            UPDATE tasks
            SET state = $1, retries = $2, next_attempt_at = $3, result = $4, error = $5, children = $6,
                lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $7
            "#,
        )
        .bind(task_state_str(new_state))
        .bind(retries as i64)
        .bind(next_attempt_at)
        .bind(&result_json)
        .bind(&error)
        .bind(&children_vec)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if task.parent_task_id.is_none() && matches!(new_state, TaskState::Completed | TaskState::Failed) {
            sqlx::query("UPDATE executions SET state = $1, result = $2, completed_at = $3 WHERE id = $4")
                .bind(if new_state == TaskState::Completed { "completed" } else { "failed" })
                .bind(&result_json)
                .bind(Utc::now())
                .bind(task.execution_id)
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
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.execution_id)
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

        let result = sqlx::query("UPDATE tasks SET children = array_append(children, $1) WHERE id = $2")
            .bind(child.id)
            .bind(parent_task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(parent_task_id));
        }

        insert_task_row(&mut tx, &child).await?;

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn on_child_terminal(&self, child_task_id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Database(e.to_string()))?;

        let row = sqlx::query("SELECT parent_task_id FROM tasks WHERE id = $1")
            .bind(child_task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(child_task_id))?;

        let parent_task_id: Option<Uuid> = row.get("parent_task_id");
        let Some(parent_task_id) = parent_task_id else {
            tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
            return Ok(());
        };

        let parent_row = sqlx::query("SELECT children, state FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(parent_task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or_else(|| StoreError::Database("parent task vanished mid-transaction".to_string()))?;

        let mut children: Vec<Uuid> = parent_row.get("children");
        let parent_state: String = parent_row.get("state");
        children.retain(|id| *id != child_task_id);

        if children.is_empty() && parse_task_state(&parent_state)? == TaskState::WaitingChildren {
            sqlx::query(
                "UPDATE tasks SET children = $1, state = 'ready', next_attempt_at = $2, lease_owner = NULL, lease_expires_at = NULL WHERE id = $3",
            )
            .bind(&children)
            .bind(Utc::now())
            .bind(parent_task_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        } else {
            sqlx::query("UPDATE tasks SET children = $1 WHERE id = $2")
                .bind(&children)
                .bind(parent_task_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::ExecutionNotFound(id))?;
        row_to_execution(&row)
    }

    #[instrument(skip(self))]
    async fn list_executions(&self, limit: usize, state_filter: Option<ExecutionState>) -> Result<Vec<Execution>, StoreError> {
        let rows = match state_filter {
            Some(state) => sqlx::query("SELECT * FROM executions WHERE state = $1 ORDER BY started_at LIMIT $2")
                .bind(state_str(state))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await,
            None => sqlx::query("SELECT * FROM executions ORDER BY started_at LIMIT $1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn list_tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn list_progress_for_execution(&self, execution_id: Uuid) -> Result<Vec<Progress>, StoreError> {
        let rows = sqlx::query("SELECT * FROM progress WHERE execution_id = $1 ORDER BY id")
            .bind(execution_id)
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

async fn insert_task_row(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>, task: &Task) -> Result<(), StoreError> {
    let tags: Vec<String> = task.tags.iter().cloned().collect();
    let children: Vec<Uuid> = task.children.iter().cloned().collect();
    let retry_policy = serde_json::to_value(&task.retry_policy).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let result = task
        .result
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO tasks (
            id, execution_id, parent_task_id, kind, procedure_name, step_name, step_index, args, state,
            retries, retry_policy, next_attempt_at, lease_owner, lease_expires_at,
            queue, tags, result, error, children
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        "#,
    )
    .bind(task.id)
    .bind(task.execution_id)
    .bind(task.parent_task_id)
    .bind(task_kind_str(task.kind))
    .bind(&task.procedure_name)
    .bind(&task.step_name)
    .bind(task.step_index as i64)
    .bind(&task.args)
    .bind(task_state_str(task.state))
    .bind(task.retries as i64)
    .bind(&retry_policy)
    .bind(task.next_attempt_at)
    .bind(&task.lease_owner)
    .bind(task.lease_expires_at)
    .bind(&task.queue)
    .bind(&tags)
    .bind(&result)
    .bind(&task.error)
    .bind(&children)
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::Database(e.to_string()))?;
    Ok(())
}
