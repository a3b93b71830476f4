//! Resolution loop: a single worker that repeatedly asks a callback to make
//! progress until it reports there is nothing left to do.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use settle_core::{Error, ResolutionSettings, Result, panic_message};
use tokio::runtime::Handle;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the progress callback wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do until the next signal.
    Done,
    /// Invoke again right away.
    RetryNow,
    /// Invoke again after the delay, or earlier if signalled.
    RetryAfter(Duration),
}

/// Callback driven by a [`ResolutionLoop`].
pub trait Progress: Send + Sync + 'static {
    /// Attempt one step of progress.
    ///
    /// # Errors
    ///
    /// Any error is logged as a transition fault and retried after the loop's
    /// error backoff.
    fn try_make_progress(&self) -> Result<Outcome>;
}

impl<F> Progress for F
where
    F: Fn() -> Result<Outcome> + Send + Sync + 'static,
{
    fn try_make_progress(&self) -> Result<Outcome> {
        self()
    }
}

/// Configuration for the resolution loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Wait after a failed or panicking progress call.
    pub error_backoff: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_settings(&ResolutionSettings::default())
    }
}

impl LoopConfig {
    #[must_use]
    pub const fn from_settings(settings: &ResolutionSettings) -> Self {
        Self {
            error_backoff: settings.error_backoff(),
        }
    }

    #[must_use]
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Non-blocking handle that asks a loop to attempt progress.
///
/// Signals are coalesced: any number of signals raised while the callback is
/// running cause exactly one further invocation.
#[derive(Debug, Clone)]
pub struct LoopWaker {
    notify: Arc<Notify>,
    alive: Arc<AtomicBool>,
}

impl LoopWaker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Request another progress attempt. A no-op once the loop is stopped.
    pub fn signal_change(&self) {
        if self.alive.load(Ordering::Acquire) {
            self.notify.notify_one();
        }
    }

    /// Whether the owning loop is still running.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

impl Default for LoopWaker {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters readable while the loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Progress invocations.
    pub cycles: u64,
    /// Invocations that returned an error or panicked.
    pub faults: u64,
}

#[derive(Debug, Default)]
struct StatsCell {
    cycles: AtomicU64,
    faults: AtomicU64,
}

enum Wait {
    Signal,
    Immediately,
    Delay(Duration),
}

/// Drives a [`Progress`] callback on one tokio task.
///
/// At most one invocation of the callback is in flight at any time.
pub struct ResolutionLoop {
    name: String,
    waker: LoopWaker,
    stop_tx: watch::Sender<bool>,
    join: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<StatsCell>,
}

impl ResolutionLoop {
    /// Spawn the worker. It stays parked until the first signal.
    pub fn spawn<P>(
        name: impl Into<String>,
        config: LoopConfig,
        handle: &Handle,
        waker: LoopWaker,
        progress: P,
    ) -> Self
    where
        P: Progress,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stats = Arc::new(StatsCell::default());

        let worker = Worker {
            name: name.clone(),
            config,
            notify: waker.notify.clone(),
            stop_rx,
            stats: stats.clone(),
            progress,
        };
        let join = handle.spawn(worker.run());

        Self {
            name,
            waker,
            stop_tx,
            join: Mutex::new(Some(join)),
            stats,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A waker for this loop.
    #[must_use]
    pub fn waker(&self) -> LoopWaker {
        self.waker.clone()
    }

    /// Request another progress attempt.
    pub fn signal_change(&self) {
        self.waker.signal_change();
    }

    /// Stop the loop. Idempotent; an in-flight callback is not interrupted.
    pub fn stop(&self) {
        if self.waker.alive.swap(false, Ordering::AcqRel) {
            debug!(resolution_loop = %self.name, "Stopping resolution loop");
            let _ = self.stop_tx.send(true);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.waker.is_alive()
    }

    /// Wait for the worker to exit. Returns immediately if already joined.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the worker task was aborted by the runtime.
    pub async fn join(&self) -> Result<()> {
        let join = self.join.lock().take();
        match join {
            Some(join) => join
                .await
                .map_err(|e| Error::stopped(format!("{} ({e})", self.name))),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> LoopStats {
        LoopStats {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            faults: self.stats.faults.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ResolutionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<P> {
    name: String,
    config: LoopConfig,
    notify: Arc<Notify>,
    stop_rx: watch::Receiver<bool>,
    stats: Arc<StatsCell>,
    progress: P,
}

impl<P: Progress> Worker<P> {
    async fn run(mut self) {
        info!(resolution_loop = %self.name, "Resolution loop started");
        let mut wait = Wait::Signal;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            let proceed = match wait {
                Wait::Signal => tokio::select! {
                    biased;
                    _ = self.stop_rx.changed() => false,
                    () = self.notify.notified() => true,
                },
                Wait::Immediately => {
                    tokio::task::yield_now().await;
                    true
                }
                Wait::Delay(delay) => tokio::select! {
                    biased;
                    _ = self.stop_rx.changed() => false,
                    () = self.notify.notified() => true,
                    () = tokio::time::sleep(delay) => true,
                },
            };

            if !proceed || *self.stop_rx.borrow() {
                break;
            }
            wait = self.cycle();
        }

        info!(resolution_loop = %self.name, "Resolution loop stopped");
    }

    fn cycle(&self) -> Wait {
        let cycle = self.stats.cycles.fetch_add(1, Ordering::Relaxed) + 1;

        let fault = match catch_unwind(AssertUnwindSafe(|| self.progress.try_make_progress())) {
            Ok(Ok(outcome)) => {
                debug!(resolution_loop = %self.name, cycle, ?outcome, "Progress attempted");
                return match outcome {
                    Outcome::Done => Wait::Signal,
                    Outcome::RetryNow => Wait::Immediately,
                    Outcome::RetryAfter(delay) if delay.is_zero() => Wait::Immediately,
                    Outcome::RetryAfter(delay) => Wait::Delay(delay),
                };
            }
            Ok(Err(e)) => Error::transition_fault(&self.name, e.to_string()),
            Err(payload) => Error::transition_fault(&self.name, panic_message(payload.as_ref())),
        };

        self.stats.faults.fetch_add(1, Ordering::Relaxed);
        warn!(
            resolution_loop = %self.name,
            error = %fault,
            backoff_ms = self.config.error_backoff.as_millis(),
            "Progress callback failed"
        );
        Wait::Delay(self.config.error_backoff)
    }
}
