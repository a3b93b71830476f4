//! Goal-seeking state machine driven by a resolution loop.
//!
//! The machine holds a current `state` and a desired `goal`. Whenever they
//! differ its resolution loop calls the transition function with
//! `(state, goal)` and applies the returned state, consulting the
//! [`Behaviors`] table to decide how long to wait before the next attempt.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use settle_core::{BoxError, Error, Result, ResultExt, panic_message};
use settle_events::{Services, TimerHandle, TimerService};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::behavior::Behaviors;
use crate::hooks::{HookEvent, HookId, HookRegistry, HooksConfig};
use crate::r#loop::{LoopConfig, LoopStats, LoopWaker, Outcome, ResolutionLoop};

/// Transition function: given `(state, goal)`, the next state or `None` for
/// "no change".
pub type TransitionFn<S> =
    Arc<dyn Fn(&S, &S) -> std::result::Result<Option<S>, BoxError> + Send + Sync + 'static>;

/// Point-in-time view of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSnapshot<S> {
    pub state: S,
    pub goal: S,
    pub at_goal: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Convergence {
    at_goal: bool,
    stopped: bool,
}

struct MachineCore<S> {
    state: S,
    goal: S,
    pending_wake: Option<TimerHandle>,
}

struct MachineInner<S> {
    name: String,
    core: Mutex<MachineCore<S>>,
    behaviors: RwLock<Behaviors<S>>,
    transition: TransitionFn<S>,
    convergence: watch::Sender<Convergence>,
    hooks: HookRegistry<S>,
    waker: LoopWaker,
    timers: Arc<dyn TimerService>,
    stopped: AtomicBool,
}

/// A state machine that converges its state toward its goal.
///
/// Cloning is cheap; clones control the same machine.
pub struct StateMachine<S> {
    inner: Arc<MachineInner<S>>,
    resolution: Arc<ResolutionLoop>,
}

impl<S> Clone for StateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            resolution: self.resolution.clone(),
        }
    }
}

impl<S> StateMachine<S>
where
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Start building a machine whose state and goal are both `initial`.
    pub fn builder(initial: S) -> StateMachineBuilder<S> {
        StateMachineBuilder::new(initial)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> S {
        self.inner.core.lock().state.clone()
    }

    pub fn goal(&self) -> S {
        self.inner.core.lock().goal.clone()
    }

    pub fn is_at_goal(&self) -> bool {
        let core = self.inner.core.lock();
        core.state == core.goal
    }

    #[must_use]
    pub fn snapshot(&self) -> MachineSnapshot<S> {
        let core = self.inner.core.lock();
        MachineSnapshot {
            state: core.state.clone(),
            goal: core.goal.clone(),
            at_goal: core.state == core.goal,
        }
    }

    /// Force the current state.
    ///
    /// Fires hooks, then consults the behaviors for the new state: a zero
    /// delay signals the loop now, a positive delay arms a delayed wake
    /// replacing any earlier one, no entry waits until prompted.
    pub fn set_state(&self, state: S) {
        let Some(delay) = self.inner.apply_state(state, None) else {
            return;
        };
        match delay {
            Some(delay) if delay.is_zero() => self.inner.waker.signal_change(),
            Some(delay) => self.inner.arm_wake(delay),
            None => {}
        }
    }

    /// Set the goal and ask the loop to converge toward it.
    pub fn set_goal(&self, goal: S) {
        {
            let mut core = self.inner.core.lock();
            if core.goal == goal {
                return;
            }
            debug!(machine = %self.inner.name, state = ?core.state, goal = ?goal, "Goal set");
            core.goal = goal;
            self.inner.publish_convergence(&core);
        }
        self.inner.waker.signal_change();
    }

    /// Re-attempt convergence now, ignoring any pending delay.
    pub fn evolve(&self) {
        self.inner.waker.signal_change();
    }

    /// Wait until `state == goal`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `timeout` expires first and `Stopped` when the
    /// machine is stopped while waiting.
    pub async fn block_until_goal_reached(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.inner.convergence.subscribe();
        let name = self.inner.name.clone();
        let wait = async move {
            let reached = rx
                .wait_for(|c| c.at_goal || c.stopped)
                .await
                .map(|c| c.at_goal)
                .unwrap_or(false);
            if reached {
                Ok(())
            } else {
                Err(Error::stopped(name))
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::timeout("block_until_goal_reached", limit))?,
            None => wait.await,
        }
    }

    pub fn set_global_delay(&self, delay: Option<Duration>) {
        self.inner.behaviors.write().set_global(delay);
    }

    pub fn set_state_delay(&self, state: S, delay: Option<Duration>) {
        self.inner.behaviors.write().set_state(state, delay);
    }

    pub fn set_pair_delay(&self, state: S, goal: S, delay: Option<Duration>) {
        self.inner.behaviors.write().set_pair(state, goal, delay);
    }

    pub fn add_enter_hook<F>(&self, state: S, hook: F) -> HookId
    where
        F: Fn(&HookEvent<S>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_enter_hook(state, Arc::new(hook))
    }

    pub fn add_exit_hook<F>(&self, state: S, hook: F) -> HookId
    where
        F: Fn(&HookEvent<S>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_exit_hook(state, Arc::new(hook))
    }

    /// # Errors
    ///
    /// Returns `IllegalRequest` for a zero period.
    pub fn set_periodic_hook<F>(&self, state: S, period: Duration, hook: F) -> Result<()>
    where
        F: Fn(&HookEvent<S>) + Send + Sync + 'static,
    {
        self.inner.hooks.set_periodic_hook(state, period, Arc::new(hook))
    }

    pub fn remove_enter_hook(&self, state: &S, id: HookId) -> bool {
        self.inner.hooks.remove_enter_hook(state, id)
    }

    pub fn remove_exit_hook(&self, state: &S, id: HookId) -> bool {
        self.inner.hooks.remove_exit_hook(state, id)
    }

    pub fn remove_periodic_hook(&self, state: &S) -> bool {
        self.inner.hooks.remove_periodic_hook(state)
    }

    #[must_use]
    pub fn loop_stats(&self) -> LoopStats {
        self.resolution.stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Stop the loop, the hooks and any pending wake. Idempotent.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.resolution.stop();
        {
            let mut core = self.inner.core.lock();
            if let Some(timer) = core.pending_wake.take() {
                self.inner.timers.cancel(&timer);
            }
        }
        self.inner.hooks.stop();
        self.inner.convergence.send_modify(|c| c.stopped = true);
        info!(machine = %self.inner.name, "State machine stopped");
    }

    /// Wait for the resolution loop to exit after [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the loop task was aborted.
    pub async fn join(&self) -> Result<()> {
        self.resolution.join().await.inspect_error(|e| {
            warn!(machine = %self.inner.name, error = %e, "Resolution loop ended abnormally");
        })
    }
}

impl<S> MachineInner<S>
where
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Apply `state`, firing hooks under the lock so transitions publish in
    /// order.
    ///
    /// With `expected` set, the state is only applied if the machine is
    /// still in that state. Returns `None` if nothing changed, otherwise the
    /// behavior delay for the new state against the current goal.
    fn apply_state(&self, state: S, expected: Option<&S>) -> Option<Option<Duration>> {
        let mut core = self.core.lock();
        if core.state == state {
            return None;
        }
        if let Some(expected) = expected {
            if core.state != *expected {
                debug!(machine = %self.name, state = ?core.state, "Discarding stale transition");
                return None;
            }
        }

        debug!(machine = %self.name, from = ?core.state, to = ?state, goal = ?core.goal, "State changed");
        core.state = state;
        self.publish_convergence(&core);
        self.hooks.on_transition(&core.state);
        Some(self.behaviors.read().resolve(&core.state, &core.goal))
    }

    fn publish_convergence(&self, core: &MachineCore<S>) {
        let at_goal = core.state == core.goal;
        self.convergence.send_if_modified(|c| {
            let changed = c.at_goal != at_goal;
            c.at_goal = at_goal;
            changed
        });
    }

    fn arm_wake(&self, delay: Duration) {
        let mut core = self.core.lock();
        if let Some(timer) = core.pending_wake.as_ref() {
            self.timers.reset(timer, delay);
            return;
        }
        let waker = self.waker.clone();
        core.pending_wake = Some(
            self.timers
                .schedule(delay, Arc::new(move || waker.signal_change())),
        );
    }

    fn make_progress(&self) -> Outcome {
        let (state, goal) = {
            let core = self.core.lock();
            if core.state == core.goal {
                return Outcome::Done;
            }
            (core.state.clone(), core.goal.clone())
        };

        let next = match catch_unwind(AssertUnwindSafe(|| (self.transition)(&state, &goal))) {
            Ok(Ok(next)) => next,
            Ok(Err(e)) => {
                let fault = Error::transition_fault(&self.name, e.to_string());
                warn!(machine = %self.name, state = ?state, goal = ?goal, error = %fault, "Transition failed");
                None
            }
            Err(payload) => {
                let fault = Error::transition_fault(&self.name, panic_message(payload.as_ref()));
                warn!(machine = %self.name, state = ?state, goal = ?goal, error = %fault, "Transition panicked");
                None
            }
        };

        if let Some(next) = next {
            self.apply_state(next, Some(&state));
        }

        let core = self.core.lock();
        if core.state == core.goal {
            return Outcome::Done;
        }
        match self.behaviors.read().resolve(&core.state, &core.goal) {
            Some(delay) if delay.is_zero() => Outcome::RetryNow,
            Some(delay) => Outcome::RetryAfter(delay),
            None => Outcome::Done,
        }
    }
}

/// Builder for [`StateMachine`].
pub struct StateMachineBuilder<S> {
    initial: S,
    name: String,
    transition: Option<TransitionFn<S>>,
    behaviors: Behaviors<S>,
    loop_config: Option<LoopConfig>,
    hooks_config: Option<HooksConfig>,
}

impl<S> StateMachineBuilder<S>
where
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        Self {
            initial,
            name: "machine".to_string(),
            transition: None,
            behaviors: Behaviors::new(),
            loop_config: None,
            hooks_config: None,
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn transition<F>(mut self, transition: F) -> Self
    where
        F: Fn(&S, &S) -> std::result::Result<Option<S>, BoxError> + Send + Sync + 'static,
    {
        self.transition = Some(Arc::new(transition));
        self
    }

    #[must_use]
    pub fn global_delay(mut self, delay: Duration) -> Self {
        self.behaviors.set_global(Some(delay));
        self
    }

    #[must_use]
    pub fn state_delay(mut self, state: S, delay: Duration) -> Self {
        self.behaviors.set_state(state, Some(delay));
        self
    }

    #[must_use]
    pub fn pair_delay(mut self, state: S, goal: S, delay: Duration) -> Self {
        self.behaviors.set_pair(state, goal, Some(delay));
        self
    }

    #[must_use]
    pub const fn loop_config(mut self, config: LoopConfig) -> Self {
        self.loop_config = Some(config);
        self
    }

    #[must_use]
    pub const fn hooks_config(mut self, config: HooksConfig) -> Self {
        self.hooks_config = Some(config);
        self
    }

    /// Build the machine and spawn its resolution loop.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` when no transition function was supplied.
    pub fn build(self, services: &Services) -> Result<StateMachine<S>> {
        let transition = self.transition.ok_or_else(|| {
            Error::config_invalid(format!("machine '{}' needs a transition function", self.name))
        })?;

        let mut hooks = HookRegistry::new(services, self.name.clone(), self.initial.clone());
        if let Some(config) = self.hooks_config {
            hooks = hooks.with_config(config);
        }
        let loop_config = self
            .loop_config
            .unwrap_or_else(|| LoopConfig::from_settings(&services.config().resolution));

        let (convergence, _) = watch::channel(Convergence {
            at_goal: true,
            stopped: false,
        });
        let waker = LoopWaker::new();
        let inner = Arc::new(MachineInner {
            name: self.name.clone(),
            core: Mutex::new(MachineCore {
                state: self.initial.clone(),
                goal: self.initial,
                pending_wake: None,
            }),
            behaviors: RwLock::new(self.behaviors),
            transition,
            convergence,
            hooks,
            waker: waker.clone(),
            timers: services.timers(),
            stopped: AtomicBool::new(false),
        });

        let driver = inner.clone();
        let resolution = ResolutionLoop::spawn(
            self.name,
            loop_config,
            services.handle(),
            waker,
            move || Ok::<_, Error>(driver.make_progress()),
        );

        Ok(StateMachine {
            inner,
            resolution: Arc::new(resolution),
        })
    }
}
