//! Per-invocation context handed to activity and orchestrator bodies

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation token for a task's execution scope.
///
/// Cloning shares the underlying flag; the worker sets it when a shutdown
/// signal arrives or when a per-task timeout elapses, and a well-behaved
/// body checks it at its own suspension points.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Context passed to a leaf activity body.
///
/// Carries attempt tracking (so a body can tell how many times it has
/// already run) and a cancellation handle tied to the task's timeout scope.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    task_id: uuid::Uuid,
    execution_id: uuid::Uuid,
    attempt: u32,
    cancellation: CancellationHandle,
}

impl ActivityContext {
    pub fn new(
        task_id: uuid::Uuid,
        execution_id: uuid::Uuid,
        attempt: u32,
        cancellation: CancellationHandle,
    ) -> Self {
        Self {
            task_id,
            execution_id,
            attempt,
            cancellation,
        }
    }

    pub fn task_id(&self) -> uuid::Uuid {
        self.task_id
    }

    pub fn execution_id(&self) -> uuid::Uuid {
        self.execution_id
    }

    /// 1-based count of this invocation, including the current one.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_handle_starts_uncancelled() {
        let handle = CancellationHandle::new();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn cancellation_is_visible_across_clones() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        handle.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn activity_context_exposes_attempt_and_ids() {
        let task_id = uuid::Uuid::now_v7();
        let execution_id = uuid::Uuid::now_v7();
        let ctx = ActivityContext::new(task_id, execution_id, 2, CancellationHandle::new());
        assert_eq!(ctx.task_id(), task_id);
        assert_eq!(ctx.execution_id(), execution_id);
        assert_eq!(ctx.attempt(), 2);
        assert!(!ctx.is_cancelled());
    }
}
