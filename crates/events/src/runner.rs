//! Task runner: executes submitted callbacks off the calling stack.

use std::panic::{AssertUnwindSafe, catch_unwind};

use settle_core::{Error, Result, panic_message};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::warn;

/// A unit of work handed to a [`TaskRunner`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes submitted callbacks on an unspecified number of workers.
///
/// Implementations must never run the task synchronously on the caller's
/// stack.
pub trait TaskRunner: Send + Sync {
    /// Submit a task for execution.
    fn submit(&self, task: Task) -> TaskHandle;
}

/// Handle to a submitted task.
#[derive(Debug, Default)]
pub struct TaskHandle {
    abort: Option<AbortHandle>,
}

impl TaskHandle {
    /// Handle for a task the runner cannot track.
    #[must_use]
    pub const fn detached() -> Self {
        Self { abort: None }
    }

    /// Whether the task is known to have finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.abort.as_ref().is_some_and(AbortHandle::is_finished)
    }

    /// Abort the task if it has not started yet.
    pub fn abort(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }
}

/// Run a task, containing any panic it raises.
///
/// Returns `false` if the task panicked.
pub(crate) fn run_contained(origin: &str, task: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!(origin, reason = %reason, "Submitted task panicked");
            false
        }
    }
}

/// Task runner backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTaskRunner {
    handle: Handle,
}

impl TokioTaskRunner {
    /// Create a runner on an explicit runtime handle.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a runner on the runtime the caller is executing in.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::no_runtime(e.to_string()))
    }
}

impl TaskRunner for TokioTaskRunner {
    fn submit(&self, task: Task) -> TaskHandle {
        let join = self.handle.spawn(async move {
            run_contained("task-runner", task);
        });
        TaskHandle {
            abort: Some(join.abort_handle()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[test]
    fn current_fails_outside_runtime() {
        let err = TokioTaskRunner::current().unwrap_err();
        assert!(matches!(err, Error::NoRuntime { .. }));
    }

    #[tokio::test]
    async fn submitted_task_runs_off_the_calling_stack() {
        let runner = TokioTaskRunner::current().expect("runtime");
        let ran = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();

        let counter = ran.clone();
        runner.submit(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }));

        // Single-threaded test runtime: nothing ran before we yielded.
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        rx.await.expect("task completed");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_task_is_contained() {
        let runner = TokioTaskRunner::current().expect("runtime");
        let (tx, rx) = oneshot::channel();

        runner.submit(Box::new(|| panic!("hook exploded")));
        runner.submit(Box::new(move || {
            let _ = tx.send(7);
        }));

        assert_eq!(rx.await.expect("runner still alive"), 7);
    }

    #[test]
    fn detached_handle_is_inert() {
        let handle = TaskHandle::detached();
        assert!(!handle.is_finished());
        handle.abort();
    }
}
