//! Event hub for topic-based pub/sub delivery.
//!
//! Publishing never runs listeners on the caller's stack. Events are appended
//! to an ordered mailbox which is drained by a single task on the
//! [`TaskRunner`]; listeners subscribed with `own_worker` are handed to the
//! runner individually instead of being invoked by the drainer.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use settle_core::{HubSettings, Result};
use tracing::{debug, warn};

use crate::runner::{TaskRunner, run_contained};

/// Listener invoked with each payload published on its topic.
pub type Listener<P> = Arc<dyn Fn(&P) + Send + Sync + 'static>;

/// Mutes a listener after `threshold` consecutive panics.
///
/// A tripped breaker stays tripped: the listener is skipped until it is
/// unsubscribed and subscribed again.
#[derive(Debug)]
pub struct CircuitBreaker {
    consecutive_panics: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(threshold: u32) -> Self {
        Self {
            consecutive_panics: AtomicU32::new(0),
            threshold,
        }
    }

    /// Whether the listener is muted.
    pub fn is_tripped(&self) -> bool {
        self.consecutive_panics.load(Ordering::Acquire) >= self.threshold
    }

    /// Record one invocation. Returns `true` when this panic tripped the breaker.
    pub fn record(&self, completed: bool) -> bool {
        if completed {
            self.consecutive_panics.store(0, Ordering::Release);
            return false;
        }
        self.consecutive_panics.fetch_add(1, Ordering::AcqRel) + 1 == self.threshold
    }

    pub fn consecutive_panics(&self) -> u32 {
        self.consecutive_panics.load(Ordering::Acquire)
    }
}

/// Options for a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Run this listener on its own task rather than on the ordered drainer.
    ///
    /// Such listeners never block the publishing cycle but lose ordering
    /// relative to other listeners.
    pub own_worker: bool,
}

impl SubscribeOptions {
    /// Ordered delivery on the hub's drainer.
    #[must_use]
    pub const fn ordered() -> Self {
        Self { own_worker: false }
    }

    /// Delivery on a dedicated task.
    #[must_use]
    pub const fn own_worker() -> Self {
        Self { own_worker: true }
    }
}

/// Identifier returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Configuration for an [`EventHub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Name used in log output.
    pub name: String,
    /// Consecutive listener failures before the listener is skipped.
    pub failure_threshold: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings("hub", &HubSettings::default())
    }
}

impl HubConfig {
    /// Build from loaded settings.
    #[must_use]
    pub fn from_settings(name: impl Into<String>, settings: &HubSettings) -> Self {
        Self {
            name: name.into(),
            failure_threshold: settings.failure_threshold,
        }
    }

    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

struct Subscriber<P> {
    id: SubscriptionId,
    listener: Listener<P>,
    options: SubscribeOptions,
    breaker: Arc<CircuitBreaker>,
}

impl<P> Clone for Subscriber<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            listener: self.listener.clone(),
            options: self.options,
            breaker: self.breaker.clone(),
        }
    }
}

struct Mailbox<K, P> {
    queue: VecDeque<(K, P)>,
    draining: bool,
    closed: bool,
}

struct HubShared<K, P> {
    config: HubConfig,
    runner: Arc<dyn TaskRunner>,
    subscribers: RwLock<HashMap<K, Vec<Subscriber<P>>>>,
    mailbox: Mutex<Mailbox<K, P>>,
    next_id: AtomicU64,
}

/// Event hub delivering payloads `P` to listeners registered per topic `K`.
pub struct EventHub<K, P> {
    shared: Arc<HubShared<K, P>>,
}

impl<K, P> Clone for EventHub<K, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, P> EventHub<K, P>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Create a new hub delivering through `runner`.
    pub fn new(runner: Arc<dyn TaskRunner>, config: HubConfig) -> Self {
        Self {
            shared: Arc::new(HubShared {
                config,
                runner,
                subscribers: RwLock::new(HashMap::new()),
                mailbox: Mutex::new(Mailbox {
                    queue: VecDeque::new(),
                    draining: false,
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Create a builder.
    pub fn builder() -> EventHubBuilder {
        EventHubBuilder::new()
    }

    /// Subscribe a listener to a topic.
    pub fn subscribe(
        &self,
        topic: K,
        listener: Listener<P>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Subscriber {
            id,
            listener,
            options,
            breaker: Arc::new(CircuitBreaker::new(self.shared.config.failure_threshold)),
        };

        debug!(hub = %self.shared.config.name, topic = ?topic, subscription = %id, "Subscribed");
        self.shared
            .subscribers
            .write()
            .entry(topic)
            .or_default()
            .push(subscriber);
        id
    }

    /// Remove a subscription. Idempotent.
    ///
    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, topic: &K, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers.write();
        let Some(list) = subscribers.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(topic);
        }
        removed
    }

    /// Number of listeners on a topic.
    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.shared.subscribers.read().get(topic).map_or(0, Vec::len)
    }

    /// Publish a payload on a topic.
    ///
    /// Never blocks on listeners. Publishing on a closed hub is a no-op and
    /// returns `false`.
    pub fn publish(&self, topic: K, payload: P) -> bool {
        let start_drainer = {
            let mut mailbox = self.shared.mailbox.lock();
            if mailbox.closed {
                debug!(hub = %self.shared.config.name, topic = ?topic, "Publish on closed hub ignored");
                return false;
            }
            mailbox.queue.push_back((topic, payload));
            !std::mem::replace(&mut mailbox.draining, true)
        };

        if start_drainer {
            let shared = self.shared.clone();
            self.shared.runner.submit(Box::new(move || shared.drain()));
        }
        true
    }

    /// Close the hub: pending events are dropped and all subscriptions removed.
    pub fn close(&self) {
        {
            let mut mailbox = self.shared.mailbox.lock();
            mailbox.closed = true;
            mailbox.queue.clear();
        }
        self.shared.subscribers.write().clear();
        debug!(hub = %self.shared.config.name, "Hub closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.mailbox.lock().closed
    }

    /// Failure threshold applied to new subscribers.
    pub fn failure_threshold(&self) -> u32 {
        self.shared.config.failure_threshold
    }
}

impl<K, P> HubShared<K, P>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut mailbox = self.mailbox.lock();
                match mailbox.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        mailbox.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&next.0, &next.1);
        }
    }

    fn deliver(&self, topic: &K, payload: &P) {
        let targets: Vec<Subscriber<P>> = self
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        for sub in targets {
            if sub.breaker.is_tripped() {
                debug!(
                    hub = %self.config.name,
                    topic = ?topic,
                    subscription = %sub.id,
                    panics = sub.breaker.consecutive_panics(),
                    "Skipping muted subscriber"
                );
                continue;
            }

            if sub.options.own_worker {
                let payload = payload.clone();
                self.runner.submit(Box::new(move || {
                    invoke(&sub, &payload);
                }));
            } else {
                invoke(&sub, payload);
            }
        }
    }
}

fn invoke<P>(sub: &Subscriber<P>, payload: &P) {
    let listener = sub.listener.clone();
    let completed = run_contained("hub-listener", || listener(payload));
    if sub.breaker.record(completed) {
        warn!(subscription = %sub.id, "Listener keeps panicking, muting it");
    }
}

/// Builder for [`EventHub`].
pub struct EventHubBuilder {
    runner: Option<Arc<dyn TaskRunner>>,
    config: HubConfig,
}

impl EventHubBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runner: None,
            config: HubConfig::default(),
        }
    }

    /// Set the task runner that drains the mailbox.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Set the hub name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the circuit breaker failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Build the hub.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` when no runner was supplied or the threshold is
    /// zero.
    pub fn build<K, P>(self) -> Result<EventHub<K, P>>
    where
        K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
        P: Clone + Send + Sync + 'static,
    {
        let runner = self
            .runner
            .ok_or_else(|| settle_core::Error::config_invalid("event hub needs a task runner"))?;
        if self.config.failure_threshold == 0 {
            return Err(settle_core::Error::config_invalid(
                "event hub failure threshold must be greater than zero",
            ));
        }
        Ok(EventHub::new(runner, self.config))
    }
}

impl Default for EventHubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::runner::TokioTaskRunner;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn setup_hub() -> EventHub<&'static str, u32> {
        let runner = Arc::new(TokioTaskRunner::current().expect("runtime"));
        EventHub::new(runner, HubConfig::default().with_failure_threshold(2))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Listener<u32> {
        let log = log.clone();
        Arc::new(move |value: &u32| log.lock().push(format!("{tag}:{value}")))
    }

    // ==========================================================================
    // Listener breaker
    // ==========================================================================

    #[test]
    fn breaker_trips_on_consecutive_panics_only() {
        let breaker = CircuitBreaker::new(2);
        assert!(!breaker.record(false));
        assert!(!breaker.record(true), "a clean run clears the streak");
        assert_eq!(breaker.consecutive_panics(), 0);

        assert!(!breaker.record(false));
        assert!(!breaker.is_tripped());
        assert!(breaker.record(false), "second panic in a row trips it");
        assert!(breaker.is_tripped());
        assert!(!breaker.record(false), "reported only once");
    }

    // ==========================================================================
    // Delivery BEHAVIORAL TESTS
    // ==========================================================================

    #[tokio::test]
    async fn should_not_deliver_on_publishing_stack() {
        let hub = setup_hub();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("a", recorder(&log, "a"), SubscribeOptions::ordered());

        assert!(hub.publish("a", 1));
        assert!(log.lock().is_empty(), "delivery must be deferred");

        settle().await;
        assert_eq!(*log.lock(), vec!["a:1".to_string()]);
    }

    #[tokio::test]
    async fn should_deliver_in_publish_order_across_topics() {
        let hub = setup_hub();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("exit", recorder(&log, "exit"), SubscribeOptions::ordered());
        hub.subscribe("enter", recorder(&log, "enter"), SubscribeOptions::ordered());

        for i in 0..5 {
            hub.publish("exit", i);
            hub.publish("enter", i);
        }
        settle().await;

        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("exit:{i}"), format!("enter:{i}")])
            .collect();
        assert_eq!(*log.lock(), expected);
    }

    #[tokio::test]
    async fn should_only_deliver_to_matching_topic() {
        let hub = setup_hub();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("a", recorder(&log, "a"), SubscribeOptions::ordered());

        hub.publish("b", 9);
        settle().await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn should_run_own_worker_listeners_on_runner() {
        let hub = setup_hub();
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        hub.subscribe(
            "a",
            Arc::new(move |_: &u32| {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::own_worker(),
        );

        hub.publish("a", 1);
        hub.publish("a", 2);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_stop_delivering_after_unsubscribe() {
        let hub = setup_hub();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = hub.subscribe("a", recorder(&log, "a"), SubscribeOptions::ordered());
        assert_eq!(hub.subscriber_count(&"a"), 1);

        assert!(hub.unsubscribe(&"a", id));
        assert!(!hub.unsubscribe(&"a", id), "second unsubscribe is a no-op");
        assert_eq!(hub.subscriber_count(&"a"), 0);

        hub.publish("a", 1);
        settle().await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn should_skip_listener_after_repeated_panics() {
        let hub = setup_hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = calls.clone();
        hub.subscribe(
            "a",
            Arc::new(move |_: &u32| {
                inner.fetch_add(1, Ordering::SeqCst);
                panic!("listener failure");
            }),
            SubscribeOptions::ordered(),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("a", recorder(&log, "ok"), SubscribeOptions::ordered());

        for i in 0..4 {
            hub.publish("a", i);
        }
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2, "breaker opens at threshold");
        assert_eq!(log.lock().len(), 4, "healthy listener unaffected");
    }

    #[tokio::test]
    async fn should_ignore_publish_after_close() {
        let hub = setup_hub();
        let log = Arc::new(Mutex::new(Vec::new()));
        hub.subscribe("a", recorder(&log, "a"), SubscribeOptions::ordered());

        hub.close();
        assert!(hub.is_closed());
        assert!(!hub.publish("a", 1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn listener_may_unsubscribe_itself() {
        let hub = setup_hub();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let hub_ref = hub.clone();
        let slot_ref = slot.clone();
        let inner = calls.clone();
        let id = hub.subscribe(
            "once",
            Arc::new(move |_: &u32| {
                inner.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *slot_ref.lock() {
                    hub_ref.unsubscribe(&"once", id);
                }
            }),
            SubscribeOptions::ordered(),
        );
        *slot.lock() = Some(id);

        hub.publish("once", 1);
        hub.publish("once", 2);
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn builder_requires_runner() {
        let result = EventHub::<&'static str, u32>::builder().build::<&'static str, u32>();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn builder_rejects_zero_threshold() {
        let runner = Arc::new(TokioTaskRunner::current().expect("runtime"));
        let result = EventHubBuilder::new()
            .with_runner(runner)
            .with_name("hooks")
            .with_failure_threshold(0)
            .build::<&'static str, u32>();
        assert!(result.is_err());
    }
}
