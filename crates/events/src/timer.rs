//! Delayed and repeating callbacks.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use settle_core::{Error, Result};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::runner::run_contained;

/// Callback invoked when a timer fires.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Unique identifier for a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(Uuid);

impl TimerId {
    /// Create a new unique timer ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Status of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    /// Timer is waiting to fire.
    Pending,
    /// One-shot timer has fired.
    Fired,
    /// Timer was cancelled.
    Cancelled,
}

impl TimerStatus {
    /// Check if the timer is terminal (won't fire again without a reset).
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Fired | Self::Cancelled)
    }
}

/// Control value written by the service and observed by the timer worker.
///
/// A worker only follows `Armed` values carrying its own epoch; anything else
/// tells it to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerControl {
    Armed { deadline: Instant, epoch: u64 },
    Cancelled,
}

#[derive(Debug)]
struct TimerState {
    status: TimerStatus,
    epoch: u64,
}

struct TimerSpec {
    callback: TimerCallback,
    period: Option<Duration>,
}

/// Handle to a scheduled timer.
///
/// Dropping the handle cancels the timer.
#[must_use = "dropping a TimerHandle cancels the timer"]
pub struct TimerHandle {
    id: TimerId,
    control: watch::Sender<TimerControl>,
    state: Arc<Mutex<TimerState>>,
    spec: Arc<TimerSpec>,
}

impl TimerHandle {
    /// Get the timer ID.
    pub const fn id(&self) -> TimerId {
        self.id
    }

    /// Get the current status.
    pub fn status(&self) -> TimerStatus {
        self.state.lock().status
    }

    /// Whether the timer repeats.
    pub fn is_repeating(&self) -> bool {
        self.spec.period.is_some()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("period", &self.spec.period)
            .finish()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.control.send_replace(TimerControl::Cancelled);
    }
}

/// Schedules callbacks after a delay.
///
/// Injected into every component that needs delayed work; there is no
/// process-wide timer registry.
pub trait TimerService: Send + Sync {
    /// Fire `callback` once after `delay`.
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Fire `callback` every `period`, first after one period.
    fn schedule_repeating(&self, period: Duration, callback: TimerCallback) -> TimerHandle;

    /// Re-arm a timer to fire `delay` from now, even if it already fired.
    fn reset(&self, handle: &TimerHandle, delay: Duration);

    /// Cancel a timer. Idempotent.
    fn cancel(&self, handle: &TimerHandle);
}

/// Timer service running one tokio task per timer.
#[derive(Debug, Clone)]
pub struct TokioTimerService {
    handle: Handle,
}

impl TokioTimerService {
    /// Create a timer service on an explicit runtime handle.
    #[must_use]
    pub const fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Create a timer service on the runtime the caller is executing in.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` when called outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::no_runtime(e.to_string()))
    }

    fn start(&self, first: Duration, spec: TimerSpec) -> TimerHandle {
        let (control, _) = watch::channel(TimerControl::Armed {
            deadline: Instant::now() + first,
            epoch: 0,
        });
        let handle = TimerHandle {
            id: TimerId::new(),
            control,
            state: Arc::new(Mutex::new(TimerState {
                status: TimerStatus::Pending,
                epoch: 0,
            })),
            spec: Arc::new(spec),
        };
        self.spawn_worker(&handle, 0);
        handle
    }

    fn spawn_worker(&self, handle: &TimerHandle, epoch: u64) {
        let worker = TimerWorker {
            id: handle.id,
            epoch,
            rx: handle.control.subscribe(),
            state: handle.state.clone(),
            spec: handle.spec.clone(),
        };
        self.handle.spawn(worker.drive());
    }
}

impl TimerService for TokioTimerService {
    fn schedule(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        self.start(
            delay,
            TimerSpec {
                callback,
                period: None,
            },
        )
    }

    fn schedule_repeating(&self, period: Duration, callback: TimerCallback) -> TimerHandle {
        self.start(
            period,
            TimerSpec {
                callback,
                period: Some(period),
            },
        )
    }

    fn reset(&self, handle: &TimerHandle, delay: Duration) {
        let deadline = Instant::now() + delay;
        let (epoch, revive) = {
            // Published under the lock so a firing worker sees either the
            // re-arm or a terminal status, never neither.
            let mut state = handle.state.lock();
            let revive = state.status.is_terminal();
            if revive {
                state.epoch = state.epoch.wrapping_add(1);
            }
            state.status = TimerStatus::Pending;
            handle.control.send_replace(TimerControl::Armed {
                deadline,
                epoch: state.epoch,
            });
            (state.epoch, revive)
        };
        if revive {
            // Any previous worker exits once it sees the new epoch.
            self.spawn_worker(handle, epoch);
        }
        debug!(timer_id = %handle.id, delay_ms = delay.as_millis(), "Timer reset");
    }

    fn cancel(&self, handle: &TimerHandle) {
        let mut state = handle.state.lock();
        state.status = TimerStatus::Cancelled;
        handle.control.send_replace(TimerControl::Cancelled);
    }
}

struct TimerWorker {
    id: TimerId,
    epoch: u64,
    rx: watch::Receiver<TimerControl>,
    state: Arc<Mutex<TimerState>>,
    spec: Arc<TimerSpec>,
}

impl TimerWorker {
    /// Deadline carried by `control` if it still addresses this worker.
    fn follow(&self, control: TimerControl) -> Option<Instant> {
        match control {
            TimerControl::Armed { deadline, epoch } if epoch == self.epoch => Some(deadline),
            TimerControl::Armed { .. } | TimerControl::Cancelled => None,
        }
    }

    async fn drive(mut self) {
        let initial = *self.rx.borrow_and_update();
        let Some(mut deadline) = self.follow(initial) else {
            return;
        };

        loop {
            tokio::select! {
                biased;
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let control = *self.rx.borrow_and_update();
                    match self.follow(control) {
                        Some(next) => deadline = next,
                        None => {
                            debug!(timer_id = %self.id, "Timer worker released");
                            return;
                        }
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    let callback = self.spec.callback.clone();
                    run_contained("timer", move || callback());
                    match self.spec.period {
                        Some(period) => deadline += period,
                        None => {
                            let mut state = self.state.lock();
                            if state.epoch == self.epoch && state.status == TimerStatus::Pending {
                                if self.rx.has_changed().unwrap_or(false) {
                                    // Reset while firing: follow the new deadline.
                                    continue;
                                }
                                state.status = TimerStatus::Fired;
                            }
                            return;
                        }
                    }
                }
            }
        }
    }
}
