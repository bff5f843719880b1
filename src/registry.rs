//! Process-wide mapping from procedure name to its callable body and metadata

use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::activity::ActivityContext;
use crate::error::RegistryError;
use crate::model::TaskKind;
use crate::orchestrator::{OrchestratorContext, OrchestratorError};
use crate::outcome::Outcome;
use crate::retry::RetryPolicy;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type OrchestratorFn = Arc<
    dyn Fn(OrchestratorContext, serde_json::Value) -> BoxFuture<'static, Result<Outcome, OrchestratorError>>
        + Send
        + Sync,
>;
pub type ActivityFn =
    Arc<dyn Fn(ActivityContext, serde_json::Value) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// A registered procedure body, type-erased behind its kind.
#[derive(Clone)]
pub enum ProcedureBody {
    Orchestrator(OrchestratorFn),
    Activity(ActivityFn),
}

impl ProcedureBody {
    pub fn kind(&self) -> TaskKind {
        match self {
            ProcedureBody::Orchestrator(_) => TaskKind::Orchestrator,
            ProcedureBody::Activity(_) => TaskKind::Activity,
        }
    }
}

/// Everything the registry knows about a durable procedure.
#[derive(Clone)]
pub struct Descriptor {
    pub name: String,
    pub body: ProcedureBody,
    pub queue: String,
    pub tags: HashSet<String>,
    pub retry_policy: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl Descriptor {
    pub fn kind(&self) -> TaskKind {
        self.body.kind()
    }
}

/// Builder for the metadata half of a [`Descriptor`], independent of the
/// body being registered.
#[derive(Debug, Clone)]
pub struct ProcedureOptions {
    pub queue: String,
    pub tags: HashSet<String>,
    pub retry_policy: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl Default for ProcedureOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            tags: HashSet::new(),
            retry_policy: RetryPolicy::no_retry(),
            timeout: None,
        }
    }
}

impl ProcedureOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Entry {
    descriptor: Descriptor,
    body_type: TypeId,
}

/// The process-wide registry of durable procedures.
///
/// Registration is idempotent under the same name and concrete body type;
/// registering a different body under an existing name fails with
/// [`RegistryError::Conflict`]. Immutable in steady state once workers
/// start polling.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an orchestrator body: one that receives an
    /// [`OrchestratorContext`] and may sub-dispatch children.
    #[instrument(skip(self, body), fields(name = %name))]
    pub fn register_orchestrator<F, Fut>(
        &self,
        name: impl Into<String>,
        options: ProcedureOptions,
        body: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(OrchestratorContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, OrchestratorError>> + Send + 'static,
    {
        let name = name.into();
        let wrapped: OrchestratorFn = Arc::new(move |ctx, args| Box::pin(body(ctx, args)));
        self.insert(
            name,
            ProcedureBody::Orchestrator(wrapped),
            options,
            TypeId::of::<F>(),
        )
    }

    /// Register an activity body: one that receives an [`ActivityContext`]
    /// and performs leaf work.
    #[instrument(skip(self, body), fields(name = %name))]
    pub fn register_activity<F, Fut>(
        &self,
        name: impl Into<String>,
        options: ProcedureOptions,
        body: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(ActivityContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let name = name.into();
        let wrapped: ActivityFn = Arc::new(move |ctx, args| Box::pin(body(ctx, args)));
        self.insert(
            name,
            ProcedureBody::Activity(wrapped),
            options,
            TypeId::of::<F>(),
        )
    }

    fn insert(
        &self,
        name: String,
        body: ProcedureBody,
        options: ProcedureOptions,
        body_type: TypeId,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&name) {
            if existing.body_type != body_type {
                return Err(RegistryError::Conflict(name));
            }
            debug!(procedure = %name, "re-registering identical procedure body, ignoring");
            return Ok(());
        }

        let descriptor = Descriptor {
            name: name.clone(),
            body,
            queue: options.queue,
            tags: options.tags,
            retry_policy: options.retry_policy,
            timeout: options.timeout,
        };
        entries.insert(name, Entry { descriptor, body_type });
        Ok(())
    }

    /// Look up a procedure's descriptor by name.
    pub fn lookup(&self, name: &str) -> Result<Descriptor, RegistryError> {
        self.entries
            .read()
            .get(name)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| RegistryError::UnknownProcedure(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ProcedureOptions {
        ProcedureOptions::default()
    }

    #[test_log::test]
    fn register_and_lookup_activity() {
        let registry = Registry::new();
        registry
            .register_activity("double", options(), |_ctx, args| async move {
                let x: i64 = serde_json::from_value(args).unwrap();
                Outcome::ok(x * 2)
            })
            .unwrap();

        assert!(registry.contains("double"));
        let descriptor = registry.lookup("double").unwrap();
        assert_eq!(descriptor.kind(), TaskKind::Activity);
        assert_eq!(descriptor.queue, "default");
    }

    #[test_log::test]
    fn unknown_procedure_is_an_error() {
        let registry = Registry::new();
        let err = registry.lookup("nope").unwrap_err();
        assert!(matches!(err, RegistryError::UnknownProcedure(name) if name == "nope"));
    }

    #[test_log::test]
    fn reregistering_same_closure_type_is_idempotent() {
        let registry = Registry::new();
        for _ in 0..2 {
            registry
                .register_activity("noop", options(), |_ctx, _args| async move { Outcome::ok(()) })
                .unwrap();
        }
        assert!(registry.contains("noop"));
    }

    #[test_log::test]
    fn reregistering_different_body_is_a_conflict() {
        let registry = Registry::new();
        registry
            .register_activity("shadowed", options(), |_ctx, _args| async move {
                Outcome::ok(1)
            })
            .unwrap();

        let err = registry
            .register_activity("shadowed", options(), |_ctx, _args| async move {
                Outcome::ok(2)
            })
            .unwrap_err();

        assert!(matches!(err, RegistryError::Conflict(name) if name == "shadowed"));
    }

    #[test_log::test]
    fn descriptor_carries_queue_and_tags_and_retry_policy() {
        let registry = Registry::new();
        let opts = ProcedureOptions::default()
            .with_queue("high_priority_queue")
            .with_tags(["data_processing".to_string()])
            .with_retry_policy(RetryPolicy::exponential().with_max_attempts(3));

        registry
            .register_activity("high_priority_data_task", opts, |_ctx, _args| async move {
                Outcome::ok(())
            })
            .unwrap();

        let descriptor = registry.lookup("high_priority_data_task").unwrap();
        assert_eq!(descriptor.queue, "high_priority_queue");
        assert!(descriptor.tags.contains("data_processing"));
        assert_eq!(descriptor.retry_policy.max_attempts, 3);
    }
}
