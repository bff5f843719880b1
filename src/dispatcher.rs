//! Client-facing entry point: submit a procedure call, inspect its progress
//!
//! The [`Dispatcher`] is the only thing application code outside a procedure
//! body needs. It never runs a procedure itself — `dispatch` just writes a
//! new [`Execution`] and its root orchestrator task, and a [`crate::worker`]
//! somewhere picks it up.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::backend::Backend;
use crate::error::DispatchError;
use crate::model::{Execution, ExecutionState, Progress, Task};
use crate::outcome::Outcome;
use crate::registry::Registry;

/// A point-in-time view of an execution: its own record plus every task and
/// progress entry recorded against it.
#[derive(Debug, Clone)]
pub struct ExecutionView {
    pub execution: Execution,
    pub tasks: Vec<Task>,
    pub progress: Vec<Progress>,
}

impl ExecutionView {
    /// A human-readable rendering of the progress log, one line per entry,
    /// in the order it was recorded.
    pub fn progress_str(&self) -> String {
        self.progress
            .iter()
            .map(|p| match &p.detail {
                Some(detail) => format!("[{}] {} ({})", p.status_str(), p.step, detail),
                None => format!("[{}] {}", p.status_str(), p.step),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Progress {
    fn status_str(&self) -> &'static str {
        match self.status {
            crate::model::ProgressStatus::Started => "started",
            crate::model::ProgressStatus::Completed => "completed",
            crate::model::ProgressStatus::Failed => "failed",
            crate::model::ProgressStatus::Retrying => "retrying",
        }
    }
}

/// Submits procedure calls and answers read-only questions about them.
///
/// Cloning is cheap: it wraps an `Arc<dyn Backend>` and an `Arc<Registry>`,
/// the same handles a [`crate::worker::Worker`] holds.
#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<Registry>) -> Self {
        Self { backend, registry }
    }

    /// Submit a call to a registered procedure. Returns the new execution's
    /// id immediately; the procedure itself runs asynchronously on whichever
    /// worker next claims its root task.
    ///
    /// `queue` and `tags` override the registered descriptor's defaults for
    /// this one call, so the same procedure can be routed differently per
    /// invocation (e.g. a `high_priority` submission of an otherwise
    /// `default`-queued procedure).
    #[instrument(skip(self, args), fields(procedure = %procedure_name))]
    pub async fn dispatch(
        &self,
        procedure_name: &str,
        args: impl Serialize,
        queue: Option<&str>,
        tags: HashSet<String>,
    ) -> Result<Uuid, DispatchError> {
        let descriptor = self.registry.lookup(procedure_name)?;
        let args_value =
            serde_json::to_value(args).map_err(|e| DispatchError::Serialization(e.to_string()))?;

        let queue = queue.unwrap_or(&descriptor.queue).to_string();
        let tags = if tags.is_empty() { descriptor.tags.clone() } else { tags };

        let execution = Execution::new(procedure_name, args_value, queue, tags);
        let root_task = Task::root_orchestrator(&execution, descriptor.retry_policy.clone());

        self.backend.insert_execution(&execution, &root_task).await?;
        info!(execution_id = %execution.id, procedure = %procedure_name, "dispatched execution");

        Ok(execution.id)
    }

    /// Fetch an execution's current state, without waiting for it to finish.
    #[instrument(skip(self))]
    pub async fn state_of(&self, execution_id: Uuid) -> Result<ExecutionState, DispatchError> {
        Ok(self.backend.get_execution(execution_id).await?.state)
    }

    /// The execution's result, if it has reached a terminal state.
    /// `Ok(None)` (not an error) while the execution is still running.
    #[instrument(skip(self))]
    pub async fn result_of(&self, execution_id: Uuid) -> Result<Option<Outcome>, DispatchError> {
        let execution = self.backend.get_execution(execution_id).await?;
        Ok(if execution.state.is_terminal() {
            execution.result
        } else {
            None
        })
    }

    /// The full view of an execution: its record, every task dispatched
    /// under it (root and descendants), and its progress log.
    #[instrument(skip(self))]
    pub async fn view(&self, execution_id: Uuid) -> Result<ExecutionView, DispatchError> {
        let execution = self.backend.get_execution(execution_id).await?;
        let tasks = self.backend.list_tasks_for_execution(execution_id).await?;
        let progress = self.backend.list_progress_for_execution(execution_id).await?;
        Ok(ExecutionView {
            execution,
            tasks,
            progress,
        })
    }

    /// List executions, most recently started first, optionally filtered by
    /// state, capped at `limit`.
    #[instrument(skip(self))]
    pub async fn list_executions(
        &self,
        limit: usize,
        state_filter: Option<ExecutionState>,
    ) -> Result<Vec<Execution>, DispatchError> {
        Ok(self.backend.list_executions(limit, state_filter).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::outcome::Outcome;
    use crate::registry::ProcedureOptions;

    async fn dispatcher_with(registry: Registry) -> (Dispatcher, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.init().await.unwrap();
        let dispatcher = Dispatcher::new(backend.clone(), Arc::new(registry));
        (dispatcher, backend)
    }

    #[test_log::test(tokio::test)]
    async fn dispatch_creates_a_pending_execution() {
        let registry = Registry::new();
        registry
            .register_activity("double", ProcedureOptions::default(), |_ctx, args| async move {
                let x: i64 = serde_json::from_value(args).unwrap();
                Outcome::ok(x * 2)
            })
            .unwrap();

        let (dispatcher, _backend) = dispatcher_with(registry).await;
        let execution_id = dispatcher.dispatch("double", 21, None, HashSet::new()).await.unwrap();

        assert_eq!(dispatcher.state_of(execution_id).await.unwrap(), ExecutionState::Pending);
        assert!(dispatcher.result_of(execution_id).await.unwrap().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn dispatch_of_unknown_procedure_is_an_error() {
        let (dispatcher, _backend) = dispatcher_with(Registry::new()).await;
        let err = dispatcher.dispatch("nope", (), None, HashSet::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Registry(_)));
    }

    #[test_log::test(tokio::test)]
    async fn dispatch_honors_queue_and_tag_overrides() {
        let registry = Registry::new();
        registry
            .register_activity(
                "leaf",
                ProcedureOptions::default().with_queue("low"),
                |_ctx, _args| async move { Outcome::ok(()) },
            )
            .unwrap();

        let (dispatcher, backend) = dispatcher_with(registry).await;
        let execution_id = dispatcher
            .dispatch("leaf", (), Some("high"), HashSet::from(["urgent".to_string()]))
            .await
            .unwrap();

        let view = dispatcher.view(execution_id).await.unwrap();
        assert_eq!(view.execution.queue, "high");
        assert!(view.execution.tags.contains("urgent"));
        let _ = backend;
    }

    #[test_log::test(tokio::test)]
    async fn view_reports_empty_progress_before_any_worker_runs() {
        let registry = Registry::new();
        registry
            .register_activity("leaf", ProcedureOptions::default(), |_ctx, _args| async move {
                Outcome::ok(())
            })
            .unwrap();

        let (dispatcher, _backend) = dispatcher_with(registry).await;
        let execution_id = dispatcher.dispatch("leaf", (), None, HashSet::new()).await.unwrap();

        let view = dispatcher.view(execution_id).await.unwrap();
        assert_eq!(view.tasks.len(), 1);
        assert!(view.progress.is_empty());
        assert_eq!(view.progress_str(), "");
    }
}
