//! # dfns
//!
//! A durable function execution engine: accepts user-submitted asynchronous
//! procedures, persists their intent and progress to storage, and executes
//! them on a pool of workers with at-least-once semantics. An execution
//! survives process restarts by resuming from its last committed
//! checkpoint; failed steps retry under a configurable policy.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                             │
//! │  (submits procedure calls, answers state_of/result_of)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Backend                               │
//! │  (InMemoryBackend / SqliteBackend / PostgresBackend)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Worker                                │
//! │  (claims tasks, invokes registered bodies, checkpoints)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Procedures come in two flavors: **activities** are leaf work, invoked once
//! per attempt; **orchestrators** may sub-dispatch child procedures and await
//! their results, and are re-invoked from the start on every resumption —
//! see [`orchestrator`] for how that replay is made deterministic.
//!
//! ## Example
//!
//! ```ignore
//! use dfns::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = Arc::new(InMemoryBackend::new());
//! backend.init().await?;
//!
//! let registry = Arc::new(Registry::new());
//! registry.register_activity("double", ProcedureOptions::default(), |_ctx, args| async move {
//!     let x: i64 = serde_json::from_value(args).unwrap();
//!     Outcome::ok(x * 2)
//! })?;
//!
//! let dispatcher = Dispatcher::new(backend.clone(), registry.clone());
//! let worker = Worker::new(backend, registry, WorkerConfig::new());
//! tokio::spawn(worker.clone().serve());
//!
//! let execution_id = dispatcher.dispatch("double", 21, None, Default::default()).await?;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod outcome;
pub mod registry;
pub mod retry;
pub mod worker;

/// Common imports for building and running durable procedures.
pub mod prelude {
    pub use crate::activity::{ActivityContext, CancellationHandle};
    pub use crate::backend::{Backend, InMemoryBackend, PostgresBackend, SqliteBackend, TaskPatch};
    pub use crate::dispatcher::{Dispatcher, ExecutionView};
    pub use crate::error::{DispatchError, RegistryError, StoreError, WorkerError};
    pub use crate::model::{Execution, ExecutionState, Progress, ProgressStatus, Task, TaskKind, TaskState};
    pub use crate::orchestrator::{ChildHandle, OrchestratorContext, OrchestratorError};
    pub use crate::outcome::Outcome;
    pub use crate::registry::{ProcedureOptions, Registry};
    pub use crate::retry::RetryPolicy;
    pub use crate::worker::{Worker, WorkerConfig};
}

pub use activity::{ActivityContext, CancellationHandle};
pub use backend::{Backend, InMemoryBackend, PostgresBackend, SqliteBackend, TaskPatch};
pub use dispatcher::{Dispatcher, ExecutionView};
pub use error::{DispatchError, RegistryError, StoreError, WorkerError};
pub use model::{Execution, ExecutionState, Progress, ProgressStatus, Task, TaskKind, TaskState};
pub use orchestrator::{ChildHandle, OrchestratorContext, OrchestratorError};
pub use outcome::Outcome;
pub use registry::{ProcedureOptions, Registry};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerConfig};
