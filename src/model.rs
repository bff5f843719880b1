//! In-memory shape of the persisted entities: [`Execution`], [`Task`], [`Progress`]

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outcome::Outcome;
use crate::retry::RetryPolicy;

/// Terminal and non-terminal states of an [`Execution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Whether a task is an orchestrator (may sub-dispatch) or a leaf activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Orchestrator,
    Activity,
}

/// States of a [`Task`], per the claim/execute/checkpoint state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Ready,
    Running,
    Completed,
    Failed,
    WaitingChildren,
    ScheduledRetry,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Whether `claim_next` may select a task in this state (subject to its
    /// `next_attempt_at` and lease predicates).
    pub fn is_claimable(self) -> bool {
        matches!(self, TaskState::Ready | TaskState::ScheduledRetry)
    }
}

/// An append-only audit record attached to an execution. See I5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub execution_id: Uuid,
    pub step: String,
    pub status: ProgressStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Started,
    Completed,
    Failed,
    Retrying,
}

/// The logical top-level invocation of a durable procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub procedure_name: String,
    pub args: serde_json::Value,
    pub state: ExecutionState,
    pub result: Option<Outcome>,
    pub queue: String,
    pub tags: HashSet<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn new(
        procedure_name: impl Into<String>,
        args: serde_json::Value,
        queue: impl Into<String>,
        tags: HashSet<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            procedure_name: procedure_name.into(),
            args,
            state: ExecutionState::Pending,
            result: None,
            queue: queue.into(),
            tags,
            started_at: None,
            completed_at: None,
        }
    }
}

/// A unit of work a worker claims and executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub kind: TaskKind,
    /// Registry key the worker looks up to find this task's body. Equal to
    /// `step_name` for every sub-dispatched task; for the root task
    /// `step_name` is the display label `"root"` while this stays the
    /// dispatched procedure's registered name.
    pub procedure_name: String,
    pub step_name: String,
    /// Ordinal of this dispatch among its parent's children; the content
    /// address used to memoize replayed sub-dispatches. Unused (0) on the
    /// root task, which has no parent.
    pub step_index: u32,
    pub args: serde_json::Value,
    pub state: TaskState,
    pub retries: u32,
    pub retry_policy: RetryPolicy,
    pub next_attempt_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub queue: String,
    pub tags: HashSet<String>,
    pub result: Option<Outcome>,
    pub error: Option<String>,
    pub children: HashSet<Uuid>,
}

impl Task {
    /// Build the root orchestrator task for a freshly dispatched execution.
    pub fn root_orchestrator(execution: &Execution, retry_policy: RetryPolicy) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id: execution.id,
            parent_task_id: None,
            kind: TaskKind::Orchestrator,
            procedure_name: execution.procedure_name.clone(),
            step_name: "root".to_string(),
            step_index: 0,
            args: execution.args.clone(),
            state: TaskState::Ready,
            retries: 0,
            retry_policy,
            next_attempt_at: Utc::now(),
            lease_owner: None,
            lease_expires_at: None,
            queue: execution.queue.clone(),
            tags: execution.tags.clone(),
            result: None,
            error: None,
            children: HashSet::new(),
        }
    }

    /// Build a child task sub-dispatched by an orchestrator.
    pub fn child(
        parent: &Task,
        step_index: u32,
        step_name: impl Into<String>,
        args: serde_json::Value,
        kind: TaskKind,
        queue: impl Into<String>,
        tags: HashSet<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        let step_name = step_name.into();
        Self {
            id: Uuid::now_v7(),
            execution_id: parent.execution_id,
            parent_task_id: Some(parent.id),
            kind,
            procedure_name: step_name.clone(),
            step_name,
            step_index,
            args,
            state: TaskState::Ready,
            retries: 0,
            retry_policy,
            next_attempt_at: Utc::now(),
            lease_owner: None,
            lease_expires_at: None,
            queue: queue.into(),
            tags,
            result: None,
            error: None,
            children: HashSet::new(),
        }
    }

    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.lease_owner.as_deref() == Some(worker_id)
    }

    pub fn lease_is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.lease_expires_at {
            Some(expires) => expires < now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_starts_pending_with_no_result() {
        let exec = Execution::new("simple_task", serde_json::json!([21]), "default", HashSet::new());
        assert_eq!(exec.state, ExecutionState::Pending);
        assert!(exec.result.is_none());
        assert!(!exec.state.is_terminal());
    }

    #[test]
    fn root_task_is_ready_orchestrator_named_root() {
        let exec = Execution::new("simple_task", serde_json::json!([21]), "default", HashSet::new());
        let task = Task::root_orchestrator(&exec, RetryPolicy::no_retry());
        assert_eq!(task.kind, TaskKind::Orchestrator);
        assert_eq!(task.step_name, "root");
        assert_eq!(task.state, TaskState::Ready);
        assert_eq!(task.retries, 0);
        assert!(task.parent_task_id.is_none());
    }

    #[test]
    fn child_task_references_parent() {
        let exec = Execution::new("wf", serde_json::json!([]), "default", HashSet::new());
        let parent = Task::root_orchestrator(&exec, RetryPolicy::no_retry());
        let child = Task::child(
            &parent,
            0,
            "leaf_step",
            serde_json::json!([1]),
            TaskKind::Activity,
            "default",
            HashSet::new(),
            RetryPolicy::no_retry(),
        );
        assert_eq!(child.parent_task_id, Some(parent.id));
        assert_eq!(child.execution_id, parent.execution_id);
    }

    #[test]
    fn terminal_states_are_recognized() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::WaitingChildren.is_terminal());
    }

    #[test]
    fn waiting_children_is_not_claimable() {
        assert!(!TaskState::WaitingChildren.is_claimable());
        assert!(TaskState::Ready.is_claimable());
        assert!(TaskState::ScheduledRetry.is_claimable());
    }
}
