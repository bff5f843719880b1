//! Fan-out / fan-in sub-dispatch: content-addressed replay for orchestrator bodies
//!
//! An orchestrator body cannot suspend mid-function and resume later the way
//! a coroutine can — it is re-invoked from scratch every time its task is
//! re-claimed. [`OrchestratorContext`] makes that replay deterministic: each
//! call to [`OrchestratorContext::dispatch_child`] is addressed by an
//! incrementing ordinal, so a replayed invocation that issues the same
//! dispatch calls in the same order finds its prior children already
//! persisted and returns their recorded handles instead of re-enqueuing.
//!
//! Awaiting children that haven't reached a terminal state yet is expressed
//! as an ordinary `Result::Err` carrying [`OrchestratorError::Suspended`].
//! Because bodies are plain `async fn`s using `?`, that error propagates out
//! of the body exactly like any other early return — the worker is the only
//! party that treats `Suspended` specially, translating it into a
//! `waiting_children` checkpoint instead of a failed attempt.

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::{RegistryError, StoreError};
use crate::model::Task;
use crate::outcome::Outcome;
use crate::registry::Registry;

/// A handle to a sub-dispatched child, returned by `dispatch_child`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildHandle {
    pub step_index: u32,
    pub task_id: Uuid,
}

/// Errors an orchestrator body may propagate with `?`.
///
/// Only [`OrchestratorError::Suspended`] is a normal, expected outcome of
/// calling an orchestrator body — it means "not done yet", not "broken".
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The body is blocked on children that haven't reached a terminal
    /// state. Carries the full set the task should record as
    /// `waiting_children`.
    #[error("suspended awaiting {0:?}")]
    Suspended(HashSet<Uuid>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode sub-dispatch arguments: {0}")]
    Serialization(String),
}

/// Context passed to an orchestrator body, carrying enough of the task's
/// persisted state to make sub-dispatch and await calls replay-safe.
pub struct OrchestratorContext {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    execution_id: Uuid,
    task_id: Uuid,
    queue: String,
    tags: HashSet<String>,
    /// Snapshot of every task belonging to this execution, as of the start
    /// of this invocation. Re-fetched on every (re-)invocation so a replay
    /// sees up-to-date terminal results for already-dispatched children.
    snapshot: Vec<Task>,
    next_ordinal: Cell<u32>,
}

impl OrchestratorContext {
    pub(crate) async fn load(
        backend: Arc<dyn Backend>,
        registry: Arc<Registry>,
        execution_id: Uuid,
        task_id: Uuid,
        queue: String,
        tags: HashSet<String>,
    ) -> Result<Self, StoreError> {
        let snapshot = backend.list_tasks_for_execution(execution_id).await?;
        Ok(Self {
            backend,
            registry,
            execution_id,
            task_id,
            queue,
            tags,
            snapshot,
            next_ordinal: Cell::new(0),
        })
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    fn existing_child(&self, ordinal: u32) -> Option<&Task> {
        self.snapshot
            .iter()
            .find(|t| t.parent_task_id == Some(self.task_id) && t.step_index == ordinal)
    }

    fn find(&self, task_id: Uuid) -> Option<&Task> {
        self.snapshot.iter().find(|t| t.id == task_id)
    }

    /// Sub-dispatch a registered procedure as a child of the current task.
    ///
    /// Content-addressed by an incrementing ordinal: the `n`th call to
    /// `dispatch_child` in a given invocation always addresses the same
    /// child across replays, as long as the body calls it in the same
    /// order with the same arguments.
    pub async fn dispatch_child(
        &self,
        procedure_name: &str,
        args: impl Serialize,
    ) -> Result<ChildHandle, OrchestratorError> {
        let ordinal = self.next_ordinal.get();
        self.next_ordinal.set(ordinal + 1);

        if let Some(existing) = self.existing_child(ordinal) {
            return Ok(ChildHandle {
                step_index: ordinal,
                task_id: existing.id,
            });
        }

        let descriptor = self.registry.lookup(procedure_name)?;
        let args_value =
            serde_json::to_value(args).map_err(|e| OrchestratorError::Serialization(e.to_string()))?;
        let parent = self
            .find(self.task_id)
            .expect("orchestrator's own task is present in its execution's snapshot");

        let child = Task::child(
            parent,
            ordinal,
            procedure_name,
            args_value,
            descriptor.body.kind(),
            descriptor.queue.clone(),
            descriptor.tags.clone(),
            descriptor.retry_policy.clone(),
        );
        let task_id = child.id;
        self.backend.insert_child_task(self.task_id, child).await?;

        Ok(ChildHandle {
            step_index: ordinal,
            task_id,
        })
    }

    /// Await a single child, returning its recorded [`Outcome`] once
    /// terminal, or propagating [`OrchestratorError::Suspended`] if it
    /// hasn't finished yet.
    pub async fn await_child(&self, handle: ChildHandle) -> Result<Outcome, OrchestratorError> {
        self.await_all(&[handle]).await
    }

    /// Fan-in: await every handle together. If all are terminal, yields
    /// `Outcome::Ok(values)` when every child succeeded, or
    /// `Outcome::Err` of the first-indexed failure otherwise — the body may
    /// inspect this value and continue rather than propagate it. If any
    /// child is not yet terminal, propagates `Suspended` with the full set
    /// of outstanding ids.
    pub async fn await_all(&self, handles: &[ChildHandle]) -> Result<Outcome, OrchestratorError> {
        let mut pending = HashSet::new();
        let mut values = Vec::with_capacity(handles.len());
        let mut first_error: Option<String> = None;

        for handle in handles {
            match self.find(handle.task_id) {
                Some(task) if task.state.is_terminal() => {
                    let result = task
                        .result
                        .clone()
                        .unwrap_or_else(|| Outcome::err("terminal task recorded no result"));
                    match &result {
                        Outcome::Ok(v) => values.push(v.clone()),
                        Outcome::Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e.clone());
                            }
                        }
                    }
                }
                _ => {
                    pending.insert(handle.task_id);
                }
            }
        }

        if !pending.is_empty() {
            return Err(OrchestratorError::Suspended(pending));
        }

        if let Some(message) = first_error {
            return Ok(Outcome::Err(message));
        }

        Ok(Outcome::Ok(serde_json::Value::Array(values)))
    }

    /// Queue and tag labels this orchestrator was dispatched under — new
    /// sub-dispatches inherit them unless the registered descriptor
    /// overrides queue/tags explicitly.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }
}
