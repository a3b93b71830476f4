//! Meta-goals: a higher-level goal resolved into an AND/OR combination of
//! sub-machine goals.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use settle_core::{Error, Result};
use settle_events::{Services, TaskRunner};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::hooks::{HookEvent, HookId, HookRegistry};
use crate::machine::StateMachine;

/// How a step's targets combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// Reached when every target is reached.
    All,
    /// Reached when any target is reached.
    Any,
}

/// One-shot completion signal handed to a [`SubGoal`].
#[derive(Clone)]
pub struct CompletionReport {
    generation: u64,
    fired: Arc<AtomicBool>,
    sink: Arc<dyn Fn(u64) + Send + Sync>,
    runner: Arc<dyn TaskRunner>,
}

impl CompletionReport {
    /// Report completion. Only the first call per target counts.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            (self.sink)(self.generation);
        }
    }

    /// Report completion from a runner task rather than the calling stack.
    pub fn fire_deferred(&self) {
        let report = self.clone();
        self.runner.submit(Box::new(move || report.fire()));
    }

    /// Notifier identity of the step this report belongs to.
    pub const fn generation(&self) -> u64 {
        self.generation
    }
}

/// Releases whatever a [`SubGoal`] registered when dropped.
#[must_use]
pub struct Engagement {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Engagement {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// An engagement with nothing to release.
    pub const fn none() -> Self {
        Self { release: None }
    }
}

impl Drop for Engagement {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A target a step can drive: usually a state machine and one of its states.
pub trait SubGoal: Send + Sync {
    /// Start driving toward the target and call `report` once it is reached.
    fn engage(&self, report: CompletionReport) -> Engagement;
}

struct MachineTarget<S> {
    machine: StateMachine<S>,
    goal: S,
}

impl<S> SubGoal for MachineTarget<S>
where
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn engage(&self, report: CompletionReport) -> Engagement {
        let on_enter = report.clone();
        let id = self
            .machine
            .add_enter_hook(self.goal.clone(), move |_| on_enter.fire());
        self.machine.set_goal(self.goal.clone());
        if self.machine.state() == self.goal {
            report.fire_deferred();
        }

        let machine = self.machine.clone();
        let goal = self.goal.clone();
        Engagement::new(move || {
            machine.remove_enter_hook(&goal, id);
        })
    }
}

/// The sub-goals a meta-goal resolves to.
#[derive(Clone)]
pub struct Step {
    combinator: Combinator,
    targets: Vec<Arc<dyn SubGoal>>,
}

impl Step {
    /// A step reached when every target is reached.
    #[must_use]
    pub fn all() -> Self {
        Self {
            combinator: Combinator::All,
            targets: Vec::new(),
        }
    }

    /// A step reached when any target is reached.
    #[must_use]
    pub fn any() -> Self {
        Self {
            combinator: Combinator::Any,
            targets: Vec::new(),
        }
    }

    /// A step with no targets; reached immediately.
    #[must_use]
    pub fn empty() -> Self {
        Self::all()
    }

    /// Add a (machine, goal) pair.
    #[must_use]
    pub fn with<S>(mut self, machine: &StateMachine<S>, goal: S) -> Self
    where
        S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    {
        self.targets.push(Arc::new(MachineTarget {
            machine: machine.clone(),
            goal,
        }));
        self
    }

    /// Add a custom target.
    #[must_use]
    pub fn with_target(mut self, target: Arc<dyn SubGoal>) -> Self {
        self.targets.push(target);
        self
    }

    pub const fn combinator(&self) -> Combinator {
        self.combinator
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    fn reports_needed(&self) -> usize {
        match self.combinator {
            Combinator::All => self.targets.len(),
            Combinator::Any => usize::from(!self.targets.is_empty()),
        }
    }
}

/// Maps a meta-goal to the step that achieves it.
pub type Resolver<M> = Arc<dyn Fn(&M) -> Step + Send + Sync + 'static>;

struct InFlight<M> {
    generation: u64,
    goal: M,
    remaining: usize,
    engagements: Vec<Engagement>,
}

impl<M> InFlight<M> {
    /// Drop every engagement, removing the completion hooks they installed.
    fn release(self) -> usize {
        let released = self.engagements.len();
        drop(self.engagements);
        released
    }
}

struct ComposerState<M> {
    meta_goal: M,
    reached: Option<M>,
    generation: u64,
    in_flight: Option<InFlight<M>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    reached: bool,
    stopped: bool,
}

struct ComposerInner<M> {
    name: String,
    state: Mutex<ComposerState<M>>,
    resolver: Resolver<M>,
    hooks: HookRegistry<M>,
    progress: watch::Sender<Progress>,
    runner: Arc<dyn TaskRunner>,
    stopped: AtomicBool,
}

/// Drives sub-machines toward the goals a meta-goal resolves to.
///
/// The composer behaves like a state machine whose state is the last meta-goal
/// it reached: its hooks fire when a new meta-goal is reached.
pub struct MetaGoalComposer<M> {
    inner: Arc<ComposerInner<M>>,
}

impl<M> Clone for MetaGoalComposer<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> MetaGoalComposer<M>
where
    M: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a composer that considers `initial` already reached.
    pub fn new<F>(services: &Services, name: impl Into<String>, initial: M, resolver: F) -> Self
    where
        F: Fn(&M) -> Step + Send + Sync + 'static,
    {
        let name = name.into();
        let (progress, _) = watch::channel(Progress {
            reached: true,
            stopped: false,
        });
        Self {
            inner: Arc::new(ComposerInner {
                hooks: HookRegistry::new(services, name.clone(), initial.clone()),
                name,
                state: Mutex::new(ComposerState {
                    meta_goal: initial.clone(),
                    reached: Some(initial),
                    generation: 0,
                    in_flight: None,
                }),
                resolver: Arc::new(resolver),
                progress,
                runner: services.runner(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn meta_goal(&self) -> M {
        self.inner.state.lock().meta_goal.clone()
    }

    /// The most recently reached meta-goal.
    pub fn reached(&self) -> Option<M> {
        self.inner.state.lock().reached.clone()
    }

    /// Whether the current meta-goal has been reached.
    pub fn is_reached(&self) -> bool {
        let state = self.inner.state.lock();
        state.in_flight.is_none() && state.reached.as_ref() == Some(&state.meta_goal)
    }

    /// Replace the meta-goal, cancelling whatever step was in flight.
    pub fn set_meta_goal(&self, goal: M) {
        if self.inner.stopped.load(Ordering::Acquire) {
            debug!(composer = %self.inner.name, "Ignoring meta-goal on stopped composer");
            return;
        }

        let step = (self.inner.resolver)(&goal);
        let (generation, cancelled) = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            state.meta_goal = goal.clone();
            let cancelled = state.in_flight.take();
            if step.is_empty() {
                self.inner.reach(&mut state, goal.clone());
            } else {
                state.in_flight = Some(InFlight {
                    generation: state.generation,
                    goal: goal.clone(),
                    remaining: step.reports_needed(),
                    engagements: Vec::new(),
                });
                self.inner.progress.send_modify(|p| p.reached = false);
            }
            (state.generation, cancelled)
        };
        if let Some(released) = cancelled.map(InFlight::release) {
            debug!(composer = %self.inner.name, released, "Cancelled previous step");
        }

        info!(
            composer = %self.inner.name,
            meta_goal = ?goal,
            targets = step.len(),
            combinator = ?step.combinator(),
            "Meta-goal set"
        );

        if step.is_empty() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let sink: Arc<dyn Fn(u64) + Send + Sync> = Arc::new(move |generation: u64| {
            if let Some(inner) = weak.upgrade() {
                inner.complete(generation);
            }
        });

        let engagements: Vec<Engagement> = step
            .targets
            .iter()
            .map(|target| {
                target.engage(CompletionReport {
                    generation,
                    fired: Arc::new(AtomicBool::new(false)),
                    sink: sink.clone(),
                    runner: self.inner.runner.clone(),
                })
            })
            .collect();

        // Completed or superseded while engaging: release right away.
        let leftover = {
            let mut state = self.inner.state.lock();
            match state.in_flight.as_mut() {
                Some(in_flight) if in_flight.generation == generation => {
                    in_flight.engagements = engagements;
                    None
                }
                _ => Some(engagements),
            }
        };
        drop(leftover);
    }

    /// Wait until the current meta-goal is reached.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when `timeout` expires first and `Stopped` when the
    /// composer is stopped while waiting.
    pub async fn block_until_reached(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.inner.progress.subscribe();
        let name = self.inner.name.clone();
        let wait = async move {
            let reached = rx
                .wait_for(|p| p.reached || p.stopped)
                .await
                .map(|p| p.reached)
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
                .map_err(|_| Error::timeout("block_until_reached", limit))?,
            None => wait.await,
        }
    }

    pub fn add_enter_hook<F>(&self, goal: M, hook: F) -> HookId
    where
        F: Fn(&HookEvent<M>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_enter_hook(goal, Arc::new(hook))
    }

    pub fn add_exit_hook<F>(&self, goal: M, hook: F) -> HookId
    where
        F: Fn(&HookEvent<M>) + Send + Sync + 'static,
    {
        self.inner.hooks.add_exit_hook(goal, Arc::new(hook))
    }

    /// # Errors
    ///
    /// Returns `IllegalRequest` for a zero period.
    pub fn set_periodic_hook<F>(&self, goal: M, period: Duration, hook: F) -> Result<()>
    where
        F: Fn(&HookEvent<M>) + Send + Sync + 'static,
    {
        self.inner.hooks.set_periodic_hook(goal, period, Arc::new(hook))
    }

    pub fn remove_enter_hook(&self, goal: &M, id: HookId) -> bool {
        self.inner.hooks.remove_enter_hook(goal, id)
    }

    pub fn remove_exit_hook(&self, goal: &M, id: HookId) -> bool {
        self.inner.hooks.remove_exit_hook(goal, id)
    }

    pub fn remove_periodic_hook(&self, goal: &M) -> bool {
        self.inner.hooks.remove_periodic_hook(goal)
    }

    /// Release the in-flight step and stop the hooks. Idempotent.
    ///
    /// Sub-machines are left running.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let cancelled = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            state.in_flight.take()
        };
        if let Some(in_flight) = cancelled {
            in_flight.release();
        }
        self.inner.hooks.stop();
        self.inner.progress.send_modify(|p| p.stopped = true);
        info!(composer = %self.inner.name, "Meta-goal composer stopped");
    }
}

impl<M> ComposerInner<M>
where
    M: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Count one completion report for `generation`.
    fn complete(&self, generation: u64) {
        let mut state = self.state.lock();
        let current = state.generation;
        if generation != current {
            debug!(composer = %self.name, generation, current, "Dropping stale completion report");
            return;
        }
        let Some(in_flight) = state.in_flight.as_mut() else {
            debug!(composer = %self.name, generation, "Dropping report for finished step");
            return;
        };

        in_flight.remaining = in_flight.remaining.saturating_sub(1);
        if in_flight.remaining > 0 {
            debug!(composer = %self.name, remaining = in_flight.remaining, "Sub-goal reached");
            return;
        }

        let released = state.in_flight.take();
        if let Some(goal) = released.as_ref().map(|f| f.goal.clone()) {
            self.reach(&mut state, goal);
        }
        drop(state);
        if let Some(in_flight) = released {
            in_flight.release();
        }
    }

    fn reach(&self, state: &mut ComposerState<M>, goal: M) {
        info!(composer = %self.name, meta_goal = ?goal, "Meta-goal reached");
        self.hooks.on_transition(&goal);
        state.reached = Some(goal);
        self.progress.send_modify(|p| p.reached = true);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use settle_core::BoxError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Power {
        Off,
        On,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Mode {
        Idle,
        Running,
        Either,
    }

    fn toggle(_: &Power, goal: &Power) -> std::result::Result<Option<Power>, BoxError> {
        Ok(Some(*goal))
    }

    fn machine(services: &Services, name: &str, delay: Duration) -> StateMachine<Power> {
        StateMachine::builder(Power::Off)
            .name(name)
            .transition(toggle)
            .pair_delay(Power::Off, Power::On, delay)
            .build(services)
            .expect("build")
    }

    /// Two machines that only switch on when evolved by a delayed retry.
    fn slow_machines(services: &Services) -> (StateMachine<Power>, StateMachine<Power>) {
        let refuse_first = |name: &str, delay| {
            let calls = Arc::new(AtomicUsize::new(0));
            StateMachine::builder(Power::Off)
                .name(name)
                .transition(move |_: &Power, goal: &Power| {
                    Ok((calls.fetch_add(1, Ordering::SeqCst) > 0).then_some(*goal))
                })
                .global_delay(delay)
                .build(services)
                .expect("build")
        };
        (
            refuse_first("fast", Duration::from_millis(100)),
            refuse_first("slow", Duration::from_millis(300)),
        )
    }

    fn composer(
        services: &Services,
        a: &StateMachine<Power>,
        b: &StateMachine<Power>,
    ) -> MetaGoalComposer<Mode> {
        let (a, b) = (a.clone(), b.clone());
        MetaGoalComposer::new(services, "plant", Mode::Idle, move |mode| match mode {
            Mode::Idle => Step::all()
                .with(&a, Power::Off)
                .with(&b, Power::Off),
            Mode::Running => Step::all().with(&a, Power::On).with(&b, Power::On),
            Mode::Either => Step::any().with(&a, Power::On).with(&b, Power::On),
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_waits_for_every_sub_goal() {
        let services = Services::current().expect("services");
        let (fast, slow) = slow_machines(&services);
        let composer = composer(&services, &fast, &slow);

        composer.set_meta_goal(Mode::Running);
        assert!(!composer.is_reached());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fast.state(), Power::On);
        assert_eq!(slow.state(), Power::Off);
        assert!(!composer.is_reached());

        composer
            .block_until_reached(Some(Duration::from_secs(1)))
            .await
            .expect("reached");
        assert_eq!(slow.state(), Power::On);
        assert_eq!(composer.reached(), Some(Mode::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn all_ignores_which_sub_goal_reports_first() {
        let services = Services::current().expect("services");
        let (fast, slow) = slow_machines(&services);
        // The second target finishes first this time.
        let composer = composer(&services, &slow, &fast);

        composer.set_meta_goal(Mode::Running);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fast.state(), Power::On);
        assert_eq!(slow.state(), Power::Off);
        assert!(!composer.is_reached());

        composer
            .block_until_reached(Some(Duration::from_secs(1)))
            .await
            .expect("reached");
        assert_eq!(slow.state(), Power::On);
        assert_eq!(composer.reached(), Some(Mode::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn any_completes_on_first_sub_goal() {
        let services = Services::current().expect("services");
        let (fast, slow) = slow_machines(&services);
        let composer = composer(&services, &fast, &slow);

        composer.set_meta_goal(Mode::Either);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(composer.is_reached());
        assert_eq!(fast.state(), Power::On);
        assert_eq!(slow.state(), Power::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn already_satisfied_step_reports_off_stack() {
        let services = Services::current().expect("services");
        let a = machine(&services, "a", Duration::ZERO);
        let b = machine(&services, "b", Duration::ZERO);
        let composer = composer(&services, &a, &b);

        composer.set_meta_goal(Mode::Running);
        composer.set_meta_goal(Mode::Idle);
        assert!(!composer.is_reached(), "reports never arrive on the caller's stack");
        composer
            .block_until_reached(Some(Duration::from_secs(1)))
            .await
            .expect("reached");
        assert_eq!(composer.reached(), Some(Mode::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_meta_goal_fires_composer_hooks() {
        let services = Services::current().expect("services");
        let a = machine(&services, "a", Duration::ZERO);
        let b = machine(&services, "b", Duration::ZERO);
        let composer = composer(&services, &a, &b);

        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        composer.add_exit_hook(Mode::Idle, move |e| sink.lock().push(("exit", e.previous)));
        let sink = log.clone();
        composer.add_enter_hook(Mode::Running, move |e| sink.lock().push(("enter", e.previous)));

        composer.set_meta_goal(Mode::Running);
        composer
            .block_until_reached(Some(Duration::from_secs(1)))
            .await
            .expect("reached");
        settle().await;

        assert_eq!(
            *log.lock(),
            vec![("exit", Some(Mode::Idle)), ("enter", Some(Mode::Idle))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_step_never_completes() {
        let services = Services::current().expect("services");
        let (fast, slow) = slow_machines(&services);
        let composer = composer(&services, &fast, &slow);

        let entered = Arc::new(AtomicUsize::new(0));
        let counter = entered.clone();
        composer.add_enter_hook(Mode::Running, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        composer.set_meta_goal(Mode::Running);
        composer.set_meta_goal(Mode::Either);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(composer.reached(), Some(Mode::Either));
        assert_eq!(entered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_step_is_reached_immediately() {
        let services = Services::current().expect("services");
        let composer = MetaGoalComposer::new(&services, "noop", 0u8, |_| Step::empty());
        composer.set_meta_goal(1);
        assert!(composer.is_reached());
        assert_eq!(composer.meta_goal(), 1);
        composer
            .block_until_reached(Some(Duration::ZERO))
            .await
            .expect("reached");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_waiters() {
        let services = Services::current().expect("services");
        let composer = MetaGoalComposer::new(&services, "stuck", 0u8, |_| {
            Step::all().with_target(Arc::new(Never))
        });
        composer.set_meta_goal(1);

        let waiter = {
            let composer = composer.clone();
            tokio::spawn(async move { composer.block_until_reached(None).await })
        };
        settle().await;
        composer.stop();
        composer.stop();

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(Error::Stopped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let services = Services::current().expect("services");
        let composer = MetaGoalComposer::new(&services, "stuck", 0u8, |_| {
            Step::any().with_target(Arc::new(Never))
        });
        composer.set_meta_goal(1);
        let err = composer
            .block_until_reached(Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    struct Never;

    impl SubGoal for Never {
        fn engage(&self, _report: CompletionReport) -> Engagement {
            Engagement::none()
        }
    }
}
