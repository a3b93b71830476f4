//! Lifecycle hooks: callbacks bound to entering, leaving or dwelling in a
//! state.
//!
//! Hooks are never run on the caller's stack. Every firing is published on an
//! [`EventHub`]; ordered subscribers are invoked by the hub's single drainer,
//! so for a transition `A -> B` all exit hooks of `A` run before any enter
//! hook of `B`.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use settle_core::{Error, HookSettings, Result};
use settle_events::{
    EventHub, Services, SubscribeOptions, SubscriptionId, TimerHandle, TimerService,
};
use tracing::debug;

/// Which lifecycle moment a hook is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Enter,
    Exit,
    Periodic,
}

/// Payload handed to every hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent<S> {
    pub kind: HookKind,
    /// The state the machine is in when the event is raised.
    pub state: S,
    /// The state it left on the most recent transition, if any.
    pub previous: Option<S>,
}

/// Hook callback.
pub type HookFn<S> = Arc<dyn Fn(&HookEvent<S>) + Send + Sync + 'static>;

/// Identifier of an enter or exit hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(SubscriptionId);

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hook_{}", self.0)
    }
}

/// Configuration for hook dispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct HooksConfig {
    /// Hand every hook to the task runner instead of the ordered drainer.
    pub own_worker: bool,
}

impl HooksConfig {
    #[must_use]
    pub const fn from_settings(settings: &HookSettings) -> Self {
        Self {
            own_worker: settings.dedicated_workers,
        }
    }

    #[must_use]
    pub const fn with_own_worker(mut self, own_worker: bool) -> Self {
        self.own_worker = own_worker;
        self
    }

    const fn options(self) -> SubscribeOptions {
        SubscribeOptions {
            own_worker: self.own_worker,
        }
    }
}

type Topic<S> = (HookKind, S);

struct PeriodicBinding {
    period: Duration,
    subscription: SubscriptionId,
}

struct Registry<S> {
    current: S,
    previous: Option<S>,
    periodic: HashMap<S, PeriodicBinding>,
    armed: Option<TimerHandle>,
    stopped: bool,
}

/// Enter, exit and periodic hooks for one state-bearing entity.
pub struct HookRegistry<S> {
    name: String,
    config: HooksConfig,
    hub: EventHub<Topic<S>, HookEvent<S>>,
    timers: Arc<dyn TimerService>,
    registry: Mutex<Registry<S>>,
}

impl<S> HookRegistry<S>
where
    S: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a registry whose entity starts in `initial`.
    pub fn new(services: &Services, name: impl Into<String>, initial: S) -> Self {
        let name = name.into();
        Self {
            config: HooksConfig::from_settings(&services.config().hooks),
            hub: services.event_hub(&format!("{name}-hooks")),
            timers: services.timers(),
            registry: Mutex::new(Registry {
                current: initial,
                previous: None,
                periodic: HashMap::new(),
                armed: None,
                stopped: false,
            }),
            name,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: HooksConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_enter_hook(&self, state: S, hook: HookFn<S>) -> HookId {
        self.add(HookKind::Enter, state, hook)
    }

    pub fn add_exit_hook(&self, state: S, hook: HookFn<S>) -> HookId {
        self.add(HookKind::Exit, state, hook)
    }

    /// Returns whether a hook was removed.
    pub fn remove_enter_hook(&self, state: &S, id: HookId) -> bool {
        self.hub.unsubscribe(&(HookKind::Enter, state.clone()), id.0)
    }

    /// Returns whether a hook was removed.
    pub fn remove_exit_hook(&self, state: &S, id: HookId) -> bool {
        self.hub.unsubscribe(&(HookKind::Exit, state.clone()), id.0)
    }

    fn add(&self, kind: HookKind, state: S, hook: HookFn<S>) -> HookId {
        debug!(entity = %self.name, ?kind, state = ?state, "Adding hook");
        HookId(
            self.hub
                .subscribe((kind, state), hook, self.config.options()),
        )
    }

    /// Bind `hook` to run every `period` while the entity is in `state`.
    ///
    /// Replaces any periodic hook already bound to `state`. If the entity is
    /// in `state` right now the timer is armed immediately.
    ///
    /// # Errors
    ///
    /// Returns `IllegalRequest` for a zero period.
    pub fn set_periodic_hook(&self, state: S, period: Duration, hook: HookFn<S>) -> Result<()> {
        if period.is_zero() {
            return Err(Error::illegal_request(format!(
                "periodic hook for {state:?} needs a non-zero period"
            )));
        }

        let mut registry = self.registry.lock();
        let subscription = self.hub.subscribe(
            (HookKind::Periodic, state.clone()),
            hook,
            self.config.options(),
        );
        let replaced = registry.periodic.insert(
            state.clone(),
            PeriodicBinding {
                period,
                subscription,
            },
        );
        if let Some(old) = replaced {
            self.hub
                .unsubscribe(&(HookKind::Periodic, state.clone()), old.subscription);
        }

        if registry.current == state && !registry.stopped {
            self.disarm(&mut registry);
            self.arm(&mut registry);
        }
        Ok(())
    }

    /// Returns whether a periodic hook was removed.
    pub fn remove_periodic_hook(&self, state: &S) -> bool {
        let mut registry = self.registry.lock();
        let Some(binding) = registry.periodic.remove(state) else {
            return false;
        };
        self.hub
            .unsubscribe(&(HookKind::Periodic, state.clone()), binding.subscription);
        if registry.current == *state {
            self.disarm(&mut registry);
        }
        true
    }

    /// Record a transition to `next` and fire the hooks it triggers.
    ///
    /// Does nothing if `next` equals the current state.
    pub fn on_transition(&self, next: &S) {
        let mut registry = self.registry.lock();
        if registry.stopped || registry.current == *next {
            return;
        }

        let previous = std::mem::replace(&mut registry.current, next.clone());
        registry.previous = Some(previous.clone());

        self.disarm(&mut registry);
        self.hub.publish(
            (HookKind::Exit, previous.clone()),
            HookEvent {
                kind: HookKind::Exit,
                state: next.clone(),
                previous: Some(previous.clone()),
            },
        );
        self.arm(&mut registry);
        self.hub.publish(
            (HookKind::Enter, next.clone()),
            HookEvent {
                kind: HookKind::Enter,
                state: next.clone(),
                previous: Some(previous),
            },
        );
    }

    /// Whether a periodic timer is currently armed.
    pub fn is_periodic_armed(&self) -> bool {
        self.registry.lock().armed.is_some()
    }

    /// The state the registry last saw.
    pub fn current(&self) -> S {
        self.registry.lock().current.clone()
    }

    /// Cancel any armed timer and stop delivering hooks. Idempotent.
    pub fn stop(&self) {
        let mut registry = self.registry.lock();
        if registry.stopped {
            return;
        }
        registry.stopped = true;
        self.disarm(&mut registry);
        registry.periodic.clear();
        drop(registry);
        self.hub.close();
        debug!(entity = %self.name, "Hooks stopped");
    }

    fn disarm(&self, registry: &mut Registry<S>) {
        if let Some(timer) = registry.armed.take() {
            self.timers.cancel(&timer);
        }
    }

    fn arm(&self, registry: &mut Registry<S>) {
        let Some(binding) = registry.periodic.get(&registry.current) else {
            return;
        };

        let hub = self.hub.clone();
        let topic = (HookKind::Periodic, registry.current.clone());
        let event = HookEvent {
            kind: HookKind::Periodic,
            state: registry.current.clone(),
            previous: registry.previous.clone(),
        };
        let period = binding.period;
        let timer = self.timers.schedule_repeating(
            period,
            Arc::new(move || {
                hub.publish(topic.clone(), event.clone());
            }),
        );
        registry.armed = Some(timer);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> HookFn<char> {
        let log = log.clone();
        Arc::new(move |event: &HookEvent<char>| {
            log.lock().push(format!("{tag}:{}", event.state));
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn registry() -> HookRegistry<char> {
        HookRegistry::new(&Services::current().expect("services"), "test", 'A')
    }

    #[tokio::test(start_paused = true)]
    async fn exit_hooks_run_before_enter_hooks() {
        let hooks = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add_enter_hook('B', recorder(&log, "enter"));
        hooks.add_exit_hook('A', recorder(&log, "exit"));
        hooks.add_exit_hook('B', recorder(&log, "exit"));
        hooks.add_enter_hook('C', recorder(&log, "enter"));

        hooks.on_transition(&'B');
        hooks.on_transition(&'C');
        assert!(log.lock().is_empty(), "hooks never run on the caller's stack");
        settle().await;

        assert_eq!(
            *log.lock(),
            vec!["exit:B", "enter:B", "exit:C", "enter:C"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn same_state_does_not_fire() {
        let hooks = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add_exit_hook('A', recorder(&log, "exit"));
        hooks.on_transition(&'A');
        settle().await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn removed_hooks_do_not_fire() {
        let hooks = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let enter = hooks.add_enter_hook('B', recorder(&log, "enter"));
        let exit = hooks.add_exit_hook('A', recorder(&log, "exit"));

        assert!(hooks.remove_enter_hook(&'B', enter));
        assert!(hooks.remove_exit_hook(&'A', exit));
        assert!(!hooks.remove_exit_hook(&'A', exit));

        hooks.on_transition(&'B');
        settle().await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_hook_runs_only_while_in_state() {
        let hooks = registry();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        hooks
            .set_periodic_hook(
                'B',
                Duration::from_millis(100),
                Arc::new(move |_: &HookEvent<char>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("non-zero period");
        assert!(!hooks.is_periodic_armed());

        hooks.on_transition(&'B');
        assert!(hooks.is_periodic_armed());
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        hooks.on_transition(&'C');
        assert!(!hooks.is_periodic_armed());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_hook_for_current_state_arms_immediately() {
        let hooks = registry();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        hooks
            .set_periodic_hook(
                'A',
                Duration::from_millis(50),
                Arc::new(move |_: &HookEvent<char>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("non-zero period");
        assert!(hooks.is_periodic_armed());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        assert!(hooks.remove_periodic_hook(&'A'));
        assert!(!hooks.remove_periodic_hook(&'A'));
        assert!(!hooks.is_periodic_armed());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replacing_periodic_hook_keeps_one_timer() {
        let hooks = registry();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        hooks
            .set_periodic_hook('A', Duration::from_millis(50), Arc::new(move |_: &HookEvent<char>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("set");
        let counter = second.clone();
        hooks
            .set_periodic_hook('A', Duration::from_millis(100), Arc::new(move |_: &HookEvent<char>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("replace");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_is_rejected() {
        let hooks = registry();
        let err = hooks
            .set_periodic_hook('A', Duration::ZERO, Arc::new(|_: &HookEvent<char>| {}))
            .unwrap_err();
        assert!(err.is_illegal_request());
    }

    #[tokio::test(start_paused = true)]
    async fn events_carry_previous_state() {
        let hooks = registry();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hooks.add_enter_hook(
            'B',
            Arc::new(move |event: &HookEvent<char>| sink.lock().push(event.clone())),
        );
        hooks.on_transition(&'B');
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec![HookEvent {
                kind: HookKind::Enter,
                state: 'B',
                previous: Some('A'),
            }]
        );
        assert_eq!(hooks.current(), 'B');
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_hooks_and_timer() {
        let hooks = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        hooks.add_enter_hook('B', recorder(&log, "enter"));
        hooks
            .set_periodic_hook('A', Duration::from_millis(10), recorder(&log, "tick"))
            .expect("set");

        hooks.stop();
        hooks.stop();
        assert!(!hooks.is_periodic_armed());
        hooks.on_transition(&'B');
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dedicated_workers_still_deliver() {
        let hooks = registry().with_config(HooksConfig::default().with_own_worker(true));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        hooks.add_enter_hook(
            'B',
            Arc::new(move |_: &HookEvent<char>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        hooks.on_transition(&'B');
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
