//! In-memory [`Backend`] used for fast unit/integration tests
//!
//! Provides the same semantics as [`super::sqlite::SqliteBackend`] and
//! [`super::postgres::PostgresBackend`] without touching a file or a
//! network. Not durable across process restarts — that's the point of the
//! other two.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Backend, TaskPatch};
use crate::error::StoreError;
use crate::model::{Execution, ExecutionState, Progress, Task, TaskState};
use crate::outcome::Outcome;

/// Everything the in-memory backend keeps, guarded by a single lock per
/// table. Good enough for tests; a real single-writer embedded store
/// mirrors this with a file instead of a `HashMap`.
#[derive(Default)]
pub struct InMemoryBackend {
    executions: RwLock<HashMap<Uuid, Execution>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    progress: RwLock<Vec<Progress>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish the owning execution in the same "transaction" as a root
    /// task's terminal checkpoint. Mirrors I6: the execution's result is
    /// written in the same lock scope as its state transition.
    fn finish_execution_if_root(&self, task: &Task) {
        if task.parent_task_id.is_some() {
            return;
        }
        let mut executions = self.executions.write();
        if let Some(execution) = executions.get_mut(&task.execution_id) {
            execution.state = match task.state {
                TaskState::Completed => ExecutionState::Completed,
                TaskState::Failed => ExecutionState::Failed,
                _ => return,
            };
            execution.result = task.result.clone();
            execution.completed_at = Some(Utc::now());
        }
    }

    /// Test-only escape hatch: force a task straight to a terminal state
    /// without going through the claim/checkpoint machinery, to set up
    /// replay scenarios that assert against an already-completed child.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn force_set_state(&self, task_id: Uuid, state: TaskState, result: Option<Outcome>) {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(&task_id) {
            task.state = state;
            task.result = result;
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_execution(&self, execution: &Execution, root_task: &Task) -> Result<(), StoreError> {
        self.executions.write().insert(execution.id, execution.clone());
        self.tasks.write().insert(root_task.id, root_task.clone());
        Ok(())
    }

    async fn claim_next(
        &self,
        queues: &[String],
        tags: &std::collections::HashSet<String>,
        worker_id: &str,
        lease_duration: std::time::Duration,
        now: chrono::DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut tasks = self.tasks.write();

        let candidate_id = tasks
            .values()
            .filter(|t| {
                t.state.is_claimable()
                    && t.next_attempt_at <= now
                    && (queues.is_empty() || queues.contains(&t.queue))
                    && (tags.is_empty() || !t.tags.is_disjoint(tags))
                    && t.lease_is_expired(now)
            })
            .min_by_key(|t| t.next_attempt_at)
            .map(|t| t.id);

        let Some(task_id) = candidate_id else {
            return Ok(None);
        };

        let task = tasks.get_mut(&task_id).expect("candidate id came from this map");
        task.state = TaskState::Running;
        task.lease_owner = Some(worker_id.to_string());
        task.lease_expires_at = Some(now + lease_duration);

        if task.parent_task_id.is_none() {
            let mut executions = self.executions.write();
            if let Some(execution) = executions.get_mut(&task.execution_id) {
                if execution.state == ExecutionState::Pending {
                    execution.state = ExecutionState::Running;
                    execution.started_at = Some(now);
                }
            }
        }

        Ok(Some(task.clone()))
    }

    async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_expires_at: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks.get_mut(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
        if !task.is_leased_by(worker_id) {
            return Err(StoreError::LeaseLost(task_id));
        }
        task.lease_expires_at = Some(lease_expires_at);
        Ok(())
    }

    async fn checkpoint_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        patch: TaskPatch,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        {
            let task = tasks.get(&task_id).ok_or(StoreError::TaskNotFound(task_id))?;
            if !task.is_leased_by(worker_id) {
                return Err(StoreError::LeaseLost(task_id));
            }
        }

        // A child can reach a terminal state and call `on_child_terminal`
        // before this checkpoint lands, since the pending set handed back
        // by a suspended body reflects a snapshot taken before any of its
        // sub-dispatches, not the children's state right now. Re-check each
        // one here so an already-terminal child isn't written back into
        // `children`, where nothing would ever wake it again.
        let still_pending = if let TaskPatch::WaitingChildren { children } = &patch {
            Some(
                children
                    .iter()
                    .filter(|child_id| tasks.get(child_id).map_or(false, |c| !c.state.is_terminal()))
                    .cloned()
                    .collect::<HashSet<_>>(),
            )
        } else {
            None
        };

        let task = tasks.get_mut(&task_id).expect("presence checked above");

        match patch {
            TaskPatch::WaitingChildren { .. } => {
                let still_pending = still_pending.expect("computed above for this patch variant");
                if still_pending.is_empty() {
                    task.state = TaskState::Ready;
                    task.next_attempt_at = Utc::now();
                    task.children = HashSet::new();
                } else {
                    task.state = TaskState::WaitingChildren;
                    task.children = still_pending;
                }
                task.lease_owner = None;
                task.lease_expires_at = None;
            }
            TaskPatch::Completed { result } => {
                task.state = TaskState::Completed;
                task.result = Some(result);
                task.lease_owner = None;
                task.lease_expires_at = None;
            }
            TaskPatch::Failed { result, error } => {
                task.state = TaskState::Failed;
                task.result = Some(result);
                task.error = Some(error);
                task.lease_owner = None;
                task.lease_expires_at = None;
            }
            TaskPatch::ScheduledRetry {
                retries,
                next_attempt_at,
                error,
            } => {
                task.state = TaskState::ScheduledRetry;
                task.retries = retries;
                task.next_attempt_at = next_attempt_at;
                task.error = Some(error);
                task.lease_owner = None;
                task.lease_expires_at = None;
            }
            TaskPatch::Released { next_attempt_at } => {
                task.state = TaskState::Ready;
                task.next_attempt_at = next_attempt_at;
                task.lease_owner = None;
                task.lease_expires_at = None;
            }
        }

        let task = task.clone();
        drop(tasks);
        self.finish_execution_if_root(&task);
        Ok(())
    }

    async fn append_progress(&self, record: Progress) -> Result<(), StoreError> {
        self.progress.write().push(record);
        Ok(())
    }

    async fn insert_child_task(&self, parent_task_id: Uuid, child: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let parent = tasks
            .get_mut(&parent_task_id)
            .ok_or(StoreError::TaskNotFound(parent_task_id))?;
        parent.children.insert(child.id);
        tasks.insert(child.id, child);
        Ok(())
    }

    async fn on_child_terminal(&self, child_task_id: Uuid) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let parent_task_id = tasks
            .get(&child_task_id)
            .ok_or(StoreError::TaskNotFound(child_task_id))?
            .parent_task_id;

        let Some(parent_task_id) = parent_task_id else {
            return Ok(());
        };

        let parent = tasks
            .get_mut(&parent_task_id)
            .ok_or(StoreError::TaskNotFound(parent_task_id))?;
        parent.children.remove(&child_task_id);
        if parent.children.is_empty() && parent.state == TaskState::WaitingChildren {
            parent.state = TaskState::Ready;
            parent.next_attempt_at = Utc::now();
            parent.lease_owner = None;
            parent.lease_expires_at = None;
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError> {
        self.executions
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn list_executions(
        &self,
        limit: usize,
        state_filter: Option<ExecutionState>,
    ) -> Result<Vec<Execution>, StoreError> {
        let mut executions: Vec<Execution> = self
            .executions
            .read()
            .values()
            .filter(|e| state_filter.map_or(true, |s| e.state == s))
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.started_at);
        executions.truncate(limit);
        Ok(executions)
    }

    async fn list_tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn list_progress_for_execution(&self, execution_id: Uuid) -> Result<Vec<Progress>, StoreError> {
        Ok(self
            .progress
            .read()
            .iter()
            .filter(|p| p.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskKind;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    fn dispatch_one() -> (InMemoryBackend, Execution, Task) {
        let backend = InMemoryBackend::new();
        let execution = Execution::new("wf", serde_json::json!([1]), "default", HashSet::new());
        let task = Task::root_orchestrator(&execution, RetryPolicy::no_retry());
        (backend, execution, task)
    }

    #[tokio::test]
    async fn insert_and_get_execution_round_trips() {
        let (backend, execution, task) = dispatch_one();
        backend.insert_execution(&execution, &task).await.unwrap();
        let fetched = backend.get_execution(execution.id).await.unwrap();
        assert_eq!(fetched.id, execution.id);
        assert_eq!(fetched.state, ExecutionState::Pending);
    }

    #[tokio::test]
    async fn claim_next_assigns_lease_and_marks_running() {
        let (backend, execution, task) = dispatch_one();
        backend.insert_execution(&execution, &task).await.unwrap();

        let claimed = backend
            .claim_next(&[], &HashSet::new(), "worker-1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
            .expect("a ready task should be claimable");

        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.lease_owner.as_deref(), Some("worker-1"));

        let miss = backend
            .claim_next(&[], &HashSet::new(), "worker-2", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();
        assert!(miss.is_none(), "leased task should not be claimable by another worker");
    }

    #[tokio::test]
    async fn queue_filter_excludes_non_matching_tasks() {
        let backend = InMemoryBackend::new();
        let execution = Execution::new("wf", serde_json::json!([]), "low", HashSet::new());
        let task = Task::root_orchestrator(&execution, RetryPolicy::no_retry());
        backend.insert_execution(&execution, &task).await.unwrap();

        let miss = backend
            .claim_next(
                &["high".to_string()],
                &HashSet::new(),
                "worker-1",
                Duration::from_secs(30),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = backend
            .claim_next(
                &["low".to_string()],
                &HashSet::new(),
                "worker-1",
                Duration::from_secs(30),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn checkpoint_completed_updates_root_execution() {
        let (backend, execution, task) = dispatch_one();
        backend.insert_execution(&execution, &task).await.unwrap();
        backend
            .claim_next(&[], &HashSet::new(), "worker-1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();

        backend
            .checkpoint_task(task.id, "worker-1", TaskPatch::Completed { result: Outcome::ok(42) })
            .await
            .unwrap();

        let fetched = backend.get_execution(execution.id).await.unwrap();
        assert_eq!(fetched.state, ExecutionState::Completed);
        assert_eq!(fetched.result, Some(Outcome::ok(42)));
    }

    #[tokio::test]
    async fn checkpoint_rejects_lost_lease() {
        let (backend, execution, task) = dispatch_one();
        backend.insert_execution(&execution, &task).await.unwrap();
        backend
            .claim_next(&[], &HashSet::new(), "worker-1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();

        let err = backend
            .checkpoint_task(task.id, "someone-else", TaskPatch::Completed { result: Outcome::ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost(id) if id == task.id));
    }

    #[tokio::test]
    async fn insert_child_task_adds_to_parent_children() {
        let (backend, execution, root) = dispatch_one();
        backend.insert_execution(&execution, &root).await.unwrap();

        let child = Task::child(
            &root,
            0,
            "leaf",
            serde_json::json!([1]),
            TaskKind::Activity,
            "default",
            HashSet::new(),
            RetryPolicy::no_retry(),
        );
        let child_id = child.id;
        backend.insert_child_task(root.id, child).await.unwrap();

        let tasks = backend.list_tasks_for_execution(execution.id).await.unwrap();
        let parent = tasks.iter().find(|t| t.id == root.id).unwrap();
        assert!(parent.children.contains(&child_id));
    }

    #[tokio::test]
    async fn on_child_terminal_reopens_waiting_parent() {
        let (backend, execution, root) = dispatch_one();
        backend.insert_execution(&execution, &root).await.unwrap();

        let child = Task::child(
            &root,
            0,
            "leaf",
            serde_json::json!([1]),
            TaskKind::Activity,
            "default",
            HashSet::new(),
            RetryPolicy::no_retry(),
        );
        let child_id = child.id;
        backend.insert_child_task(root.id, child).await.unwrap();

        backend
            .claim_next(&[], &HashSet::new(), "worker-1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();
        backend
            .checkpoint_task(
                root.id,
                "worker-1",
                TaskPatch::WaitingChildren {
                    children: HashSet::from([child_id]),
                },
            )
            .await
            .unwrap();

        backend.on_child_terminal(child_id).await.unwrap();

        let tasks = backend.list_tasks_for_execution(execution.id).await.unwrap();
        let parent = tasks.iter().find(|t| t.id == root.id).unwrap();
        assert_eq!(parent.state, TaskState::Ready);
        assert!(parent.children.is_empty());
        assert!(parent.lease_owner.is_none());
    }
}
