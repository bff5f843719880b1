//! Claim / execute / checkpoint loop driving registered procedures to completion
//!
//! A [`Worker`] repeatedly claims eligible tasks from a [`Backend`], invokes
//! the registered body, and writes the outcome back via `checkpoint_task`.
//! Every transition is gated on still holding the task's lease, which is
//! what makes at-least-once delivery safe under worker crash or lease theft:
//! a worker that loses its lease mid-execution simply has its checkpoint
//! rejected and abandons the result.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityContext, CancellationHandle};
use crate::backend::{Backend, TaskPatch};
use crate::error::WorkerError;
use crate::model::{Progress, ProgressStatus, Task};
use crate::orchestrator::{OrchestratorContext, OrchestratorError};
use crate::outcome::Outcome;
use crate::registry::{Descriptor, ProcedureBody, Registry};

/// Tunables for one worker's claim loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Empty means "every queue".
    pub queues: Vec<String>,
    /// Empty means "every tag".
    pub tags: HashSet<String>,
    pub poll_interval: Duration,
    pub max_concurrency: usize,
    pub lease_duration: Duration,
    /// How long `shutdown` waits for in-flight tasks to reach a checkpoint
    /// before giving up and returning with work still outstanding.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            queues: Vec::new(),
            tags: HashSet::new(),
            poll_interval: Duration::from_millis(200),
            max_concurrency: 10,
            lease_duration: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_queues(mut self, queues: impl IntoIterator<Item = String>) -> Self {
        self.queues = queues.into_iter().collect();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// What a claimed task's invocation resolved to, before it's written back.
enum Resolution {
    Completed(Outcome),
    Failed(String),
    Suspended(HashSet<Uuid>),
}

/// A pool of one cooperative worker claiming and executing tasks from a
/// shared [`Backend`] against procedures in a shared [`Registry`].
///
/// Concurrency within one `Worker` is bounded by `max_concurrency` in-flight
/// tasks, each running on its own spawned future; coordination across
/// workers (in this process or others) happens only through the backend's
/// atomic claim.
pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    config: WorkerConfig,
    active: Arc<Semaphore>,
    cancellations: Arc<Mutex<HashMap<Uuid, CancellationHandle>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<Registry>, config: WorkerConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_concurrency = config.max_concurrency;
        Arc::new(Self {
            backend,
            registry,
            config,
            active: Arc::new(Semaphore::new(max_concurrency)),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the claim loop until `shutdown` is called. Cheap to cancel by
    /// dropping the returned future's task — in-flight tasks are abandoned
    /// (and recovered by lease expiry) rather than drained in that case;
    /// prefer `shutdown` for a clean stop.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn serve(self: Arc<Self>) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.config.worker_id,
            queues = ?self.config.queues,
            max_concurrency = self.config.max_concurrency,
            "worker starting"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = match self.active.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                        _ = shutdown_rx.changed() => continue,
                    }
                }
            };

            let claimed = self
                .backend
                .claim_next(
                    &self.config.queues,
                    &self.config.tags,
                    &self.config.worker_id,
                    self.config.lease_duration,
                    Utc::now(),
                )
                .await?;

            let Some(task) = claimed else {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    _ = shutdown_rx.changed() => continue,
                }
            };

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.handle_task(task).await;
                drop(permit);
            });
        }

        debug!("claim loop stopped, draining in-flight tasks");
        self.drain().await
    }

    /// Signal the claim loop to stop and wait (up to `shutdown_timeout`) for
    /// in-flight tasks to reach a checkpoint.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        let _ = self.shutdown_tx.send(true);
        for handle in self.cancellations.lock().values() {
            handle.cancel();
        }
        self.drain().await
    }

    async fn drain(&self) -> Result<(), WorkerError> {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.active.available_permits() == self.config.max_concurrency {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(worker_id = %self.config.worker_id, "shutdown timed out with tasks still in flight");
                return Err(WorkerError::Shutdown);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[instrument(skip(self, task), fields(worker_id = %self.config.worker_id, task_id = %task.id, step = %task.step_name))]
    async fn handle_task(&self, task: Task) {
        if let Err(e) = self
            .backend
            .append_progress(Progress {
                execution_id: task.execution_id,
                step: task.step_name.clone(),
                status: ProgressStatus::Started,
                started_at: Some(Utc::now()),
                completed_at: None,
                detail: None,
            })
            .await
        {
            warn!(task_id = %task.id, error = %e, "failed to append started progress");
        }

        let descriptor = match self.registry.lookup(&task.procedure_name) {
            Ok(d) => d,
            Err(e) => {
                self.checkpoint_failure(&task, e.to_string()).await;
                return;
            }
        };

        let cancellation = CancellationHandle::new();
        self.cancellations.lock().insert(task.id, cancellation.clone());

        let resolution = self.invoke(&task, &descriptor, cancellation.clone()).await;

        self.cancellations.lock().remove(&task.id);

        match resolution {
            Resolution::Completed(outcome) => self.checkpoint_completed(&task, outcome).await,
            Resolution::Failed(error) => self.checkpoint_failure(&task, error).await,
            Resolution::Suspended(pending) => self.checkpoint_suspended(&task, pending).await,
        }
    }

    async fn invoke(&self, task: &Task, descriptor: &Descriptor, cancellation: CancellationHandle) -> Resolution {
        let body = self.run_body_with_lease_renewal(task, descriptor, cancellation.clone());

        match descriptor.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, body).await {
                Ok(resolution) => resolution,
                Err(_) => {
                    cancellation.cancel();
                    Resolution::Failed(format!("timeout: task exceeded {timeout:?}"))
                }
            },
            None => body.await,
        }
    }

    /// Runs the body while periodically renewing the task's lease, so a slow
    /// body doesn't have its lease stolen by another worker mid-execution.
    /// Renewal ticks every third of the lease duration, matching the margin
    /// `claim_next` needs to tell an expired lease from a live one.
    async fn run_body_with_lease_renewal(&self, task: &Task, descriptor: &Descriptor, cancellation: CancellationHandle) -> Resolution {
        let body = self.run_body(task, descriptor, cancellation);
        tokio::pin!(body);

        let renew_every = (self.config.lease_duration / 3).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(renew_every);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                resolution = &mut body => return resolution,
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .backend
                        .renew_lease(task.id, &self.config.worker_id, Utc::now() + self.config.lease_duration)
                        .await
                    {
                        warn!(task_id = %task.id, error = %e, "failed to renew lease");
                    }
                }
            }
        }
    }

    async fn run_body(&self, task: &Task, descriptor: &Descriptor, cancellation: CancellationHandle) -> Resolution {
        match &descriptor.body {
            ProcedureBody::Activity(body) => {
                let ctx = ActivityContext::new(task.id, task.execution_id, task.retries + 1, cancellation);
                match body(ctx, task.args.clone()).await {
                    Outcome::Ok(v) => Resolution::Completed(Outcome::Ok(v)),
                    Outcome::Err(e) => Resolution::Failed(e),
                }
            }
            ProcedureBody::Orchestrator(body) => {
                let ctx = match OrchestratorContext::load(
                    Arc::clone(&self.backend),
                    Arc::clone(&self.registry),
                    task.execution_id,
                    task.id,
                    task.queue.clone(),
                    task.tags.clone(),
                )
                .await
                {
                    Ok(ctx) => ctx,
                    Err(e) => return Resolution::Failed(e.to_string()),
                };

                match body(ctx, task.args.clone()).await {
                    Ok(Outcome::Ok(v)) => Resolution::Completed(Outcome::Ok(v)),
                    Ok(Outcome::Err(e)) => Resolution::Failed(e),
                    Err(OrchestratorError::Suspended(pending)) => Resolution::Suspended(pending),
                    Err(other) => Resolution::Failed(other.to_string()),
                }
            }
        }
    }

    async fn checkpoint_completed(&self, task: &Task, outcome: Outcome) {
        let patch = TaskPatch::Completed { result: outcome };
        if let Err(e) = self.backend.checkpoint_task(task.id, &self.config.worker_id, patch).await {
            debug!(task_id = %task.id, error = %e, "lost lease before completion checkpoint");
            return;
        }
        self.append_terminal_progress(task, ProgressStatus::Completed, None).await;
        self.propagate_to_parent(task).await;
    }

    async fn checkpoint_failure(&self, task: &Task, error: String) {
        if task.retry_policy.has_attempts_remaining(task.retries) {
            let retries = task.retries + 1;
            let next_attempt_at = Utc::now() + task.retry_policy.delay_for_retry(retries);
            let patch = TaskPatch::ScheduledRetry {
                retries,
                next_attempt_at,
                error: error.clone(),
            };
            if let Err(e) = self.backend.checkpoint_task(task.id, &self.config.worker_id, patch).await {
                debug!(task_id = %task.id, error = %e, "lost lease before retry checkpoint");
                return;
            }
            self.append_terminal_progress(task, ProgressStatus::Retrying, Some(error)).await;
            return;
        }

        let patch = TaskPatch::Failed {
            result: Outcome::err(error.clone()),
            error: error.clone(),
        };
        if let Err(e) = self.backend.checkpoint_task(task.id, &self.config.worker_id, patch).await {
            debug!(task_id = %task.id, error = %e, "lost lease before failure checkpoint");
            return;
        }
        self.append_terminal_progress(task, ProgressStatus::Failed, Some(error)).await;
        self.propagate_to_parent(task).await;
    }

    async fn checkpoint_suspended(&self, task: &Task, pending: HashSet<Uuid>) {
        let patch = TaskPatch::WaitingChildren { children: pending };
        if let Err(e) = self.backend.checkpoint_task(task.id, &self.config.worker_id, patch).await {
            debug!(task_id = %task.id, error = %e, "lost lease before suspend checkpoint");
        }
    }

    async fn append_terminal_progress(&self, task: &Task, status: ProgressStatus, detail: Option<String>) {
        if let Err(e) = self
            .backend
            .append_progress(Progress {
                execution_id: task.execution_id,
                step: task.step_name.clone(),
                status,
                started_at: None,
                completed_at: Some(Utc::now()),
                detail,
            })
            .await
        {
            warn!(task_id = %task.id, error = %e, "failed to append terminal progress");
        }
    }

    async fn propagate_to_parent(&self, task: &Task) {
        if task.parent_task_id.is_some() {
            if let Err(e) = self.backend.on_child_terminal(task.id).await {
                warn!(task_id = %task.id, error = %e, "failed to notify parent of child termination");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::dispatcher::Dispatcher;
    use crate::model::ExecutionState;
    use crate::registry::ProcedureOptions;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn poll_until_terminal(dispatcher: &Dispatcher, execution_id: Uuid) -> ExecutionState {
        for _ in 0..200 {
            let state = dispatcher.state_of(execution_id).await.unwrap();
            if state.is_terminal() {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution never reached a terminal state");
    }

    #[test_log::test(tokio::test)]
    async fn simple_activity_completes() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.init().await.unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .register_activity("simple_task", ProcedureOptions::default(), |_ctx, args| async move {
                let x: i64 = serde_json::from_value(args).unwrap();
                Outcome::ok(x * 2)
            })
            .unwrap();

        let dispatcher = Dispatcher::new(backend.clone(), registry.clone());
        let execution_id = dispatcher.dispatch("simple_task", 21, None, HashSet::new()).await.unwrap();

        let worker = Worker::new(backend, registry, WorkerConfig::new().with_poll_interval(Duration::from_millis(5)));
        let handle = tokio::spawn(worker.clone().serve());

        let state = poll_until_terminal(&dispatcher, execution_id).await;
        assert_eq!(state, ExecutionState::Completed);
        assert_eq!(dispatcher.result_of(execution_id).await.unwrap(), Some(Outcome::ok(42)));

        worker.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn failing_activity_records_failure_progress() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.init().await.unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .register_activity("failing_task", ProcedureOptions::default(), |_ctx, _args| async move {
                Outcome::err("I failed")
            })
            .unwrap();

        let dispatcher = Dispatcher::new(backend.clone(), registry.clone());
        let execution_id = dispatcher.dispatch("failing_task", (), None, HashSet::new()).await.unwrap();

        let worker = Worker::new(backend, registry, WorkerConfig::new().with_poll_interval(Duration::from_millis(5)));
        let handle = tokio::spawn(worker.clone().serve());

        let state = poll_until_terminal(&dispatcher, execution_id).await;
        assert_eq!(state, ExecutionState::Failed);

        let view = dispatcher.view(execution_id).await.unwrap();
        assert!(view
            .progress
            .iter()
            .any(|p| p.status == ProgressStatus::Failed && p.detail.as_deref() == Some("I failed")));

        worker.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn stateful_retry_succeeds_on_third_attempt() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.init().await.unwrap();
        let registry = Arc::new(Registry::new());

        let counter = Arc::new(AtomicU32::new(0));
        let counter_for_body = counter.clone();
        registry
            .register_activity(
                "stateful_retry_task",
                ProcedureOptions::default().with_retry_policy(
                    RetryPolicy::fixed(Duration::from_millis(5), 4),
                ),
                move |_ctx, _args| {
                    let counter = counter_for_body.clone();
                    async move {
                        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if count < 3 {
                            Outcome::err(format!("attempt {count} failed"))
                        } else {
                            Outcome::ok(count)
                        }
                    }
                },
            )
            .unwrap();

        let dispatcher = Dispatcher::new(backend.clone(), registry.clone());
        let execution_id = dispatcher.dispatch("stateful_retry_task", (), None, HashSet::new()).await.unwrap();

        let worker = Worker::new(backend.clone(), registry, WorkerConfig::new().with_poll_interval(Duration::from_millis(5)));
        let handle = tokio::spawn(worker.clone().serve());

        let state = poll_until_terminal(&dispatcher, execution_id).await;
        assert_eq!(state, ExecutionState::Completed);
        assert_eq!(dispatcher.result_of(execution_id).await.unwrap(), Some(Outcome::ok(3)));

        let tasks = backend.list_tasks_for_execution(execution_id).await.unwrap();
        assert_eq!(tasks[0].retries, 2);

        worker.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn queue_filter_only_claims_matching_tasks() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.init().await.unwrap();
        let registry = Arc::new(Registry::new());
        registry
            .register_activity("hp_task", ProcedureOptions::default().with_queue("high"), |_ctx, _args| async move {
                Outcome::ok(())
            })
            .unwrap();
        registry
            .register_activity("lp_task", ProcedureOptions::default().with_queue("low"), |_ctx, _args| async move {
                Outcome::ok(())
            })
            .unwrap();

        let dispatcher = Dispatcher::new(backend.clone(), registry.clone());
        let hp_id = dispatcher.dispatch("hp_task", (), None, HashSet::new()).await.unwrap();
        let lp_id = dispatcher.dispatch("lp_task", (), None, HashSet::new()).await.unwrap();

        let worker = Worker::new(
            backend.clone(),
            registry.clone(),
            WorkerConfig::new()
                .with_queues(["high".to_string()])
                .with_poll_interval(Duration::from_millis(5)),
        );
        let handle = tokio::spawn(worker.clone().serve());

        let hp_state = poll_until_terminal(&dispatcher, hp_id).await;
        assert_eq!(hp_state, ExecutionState::Completed);
        assert_eq!(dispatcher.state_of(lp_id).await.unwrap(), ExecutionState::Pending);

        worker.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
