//! The durable storage contract: atomic task claim, checkpoint, list, query
//!
//! Two realizations share this trait: [`memory::InMemoryBackend`] for tests,
//! [`sqlite::SqliteBackend`] (embedded, single-file) and
//! [`postgres::PostgresBackend`] (networked, many workers) for production.

pub mod memory;
pub mod postgres;
pub mod sqlite;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Execution, ExecutionState, Progress, Task};

pub use memory::InMemoryBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// A field update applied to a task, always scoped by lease ownership.
#[derive(Debug, Clone)]
pub enum TaskPatch {
    /// Suspend on outstanding children; releases the worker's lease.
    WaitingChildren { children: HashSet<Uuid> },
    /// Terminal success.
    Completed { result: crate::outcome::Outcome },
    /// Terminal failure (no attempts remaining, or non-retryable).
    Failed {
        result: crate::outcome::Outcome,
        error: String,
    },
    /// Failure with attempts remaining; releases the lease.
    ScheduledRetry {
        retries: u32,
        next_attempt_at: DateTime<Utc>,
        error: String,
    },
    /// Revert to claimable without consuming a retry (worker shutdown).
    Released { next_attempt_at: DateTime<Utc> },
}

/// The durable storage contract. Every operation is atomic with respect to
/// concurrent callers; see each method for its exact isolation guarantee.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create schema if absent. Idempotent.
    async fn init(&self) -> Result<(), StoreError>;

    /// Write a new execution and its root orchestrator task in one
    /// transaction.
    async fn insert_execution(&self, execution: &Execution, root_task: &Task) -> Result<(), StoreError>;

    /// Select one claimable task matching the filters and atomically assign
    /// a lease to `worker_id`. Returns `None` if nothing is claimable.
    ///
    /// `queues` empty means "all queues"; `tags` empty means "all tags".
    async fn claim_next(
        &self,
        queues: &[String],
        tags: &HashSet<String>,
        worker_id: &str,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Extend a held lease. Fails with [`StoreError::LeaseLost`] if the
    /// caller no longer owns the task.
    async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Apply a field update iff `worker_id` still owns the task's lease.
    async fn checkpoint_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        patch: TaskPatch,
    ) -> Result<(), StoreError>;

    /// Append a progress record. Never mutated or removed afterward (I5).
    async fn append_progress(&self, record: Progress) -> Result<(), StoreError>;

    /// Insert a child task (state=ready) and add its id to the parent's
    /// `children` set. One transaction.
    async fn insert_child_task(&self, parent_task_id: Uuid, child: Task) -> Result<(), StoreError>;

    /// Remove `child_task_id` from its parent's `children`; if the set
    /// becomes empty and the parent is `waiting_children`, flip it back to
    /// `ready` with a fresh `next_attempt_at` and no lease. One transaction.
    async fn on_child_terminal(&self, child_task_id: Uuid) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution, StoreError>;

    async fn list_executions(
        &self,
        limit: usize,
        state_filter: Option<ExecutionState>,
    ) -> Result<Vec<Execution>, StoreError>;

    async fn list_tasks_for_execution(&self, execution_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// All progress records for an execution, in append order.
    async fn list_progress_for_execution(&self, execution_id: Uuid) -> Result<Vec<Progress>, StoreError>;
}
