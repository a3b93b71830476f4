//! Priority admission scheduler with graceful drain.
//!
//! Callers ask to begin an activity and wait until the policy admits it. A
//! resolution loop re-evaluates the pending queue whenever something changes:
//! a new request, an activity ending, or a drain.

use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use settle_core::{AdmissionSettings, Error, OptionExt, Result, panic_message};
use settle_events::Services;
use settle_reconciler::{LoopConfig, LoopWaker, Outcome, ResolutionLoop};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::policy::{AdmissionPolicy, LiveCounts};

/// Priority of the drain sentinel; requests never go below it.
const DRAIN_PRIORITY: i64 = i64::MIN;

/// Configuration for an [`AdmissionScheduler`].
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Name used in log output.
    pub name: String,
    pub loop_config: LoopConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            name: AdmissionSettings::default().name,
            loop_config: LoopConfig::default(),
        }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub fn from_services(services: &Services) -> Self {
        Self {
            name: services.config().admission.name.clone(),
            loop_config: LoopConfig::from_settings(&services.config().resolution),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Queue and live-count snapshot.
#[derive(Debug, Clone)]
pub struct SchedulerStats<A> {
    pub pending: usize,
    pub live: LiveCounts<A>,
    pub alive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot<A> {
    Activity(A),
    Drain,
}

struct Pending<A> {
    ticket: u64,
    slot: Slot<A>,
    priority: i64,
    release: oneshot::Sender<()>,
}

struct SchedulerState<A> {
    pending: Vec<Pending<A>>,
    live: LiveCounts<A>,
    drain_live: bool,
    alive: bool,
    next_ticket: u64,
}

struct SchedulerInner<A> {
    name: String,
    state: Mutex<SchedulerState<A>>,
    policy: Box<dyn AdmissionPolicy<A>>,
    waker: LoopWaker,
    drained: watch::Sender<bool>,
}

/// A queued request owned by the waiting caller.
///
/// Dropping it after the scheduler released it ends the activity, so a caller
/// cancelled at the wrong moment never leaves an unowned live count behind.
struct Admission<A>
where
    A: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    inner: Arc<SchedulerInner<A>>,
    ticket: u64,
    activity: A,
    release: Option<oneshot::Receiver<()>>,
}

impl<A> Admission<A>
where
    A: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Wait for the release. `false` if the request was refused or withdrawn.
    async fn admitted(&mut self) -> bool {
        let Some(release) = self.release.as_mut() else {
            return false;
        };
        let admitted = release.await.is_ok();
        self.release = None;
        admitted
    }
}

impl<A> Drop for Admission<A>
where
    A: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let Some(mut release) = self.release.take() else {
            return;
        };
        release.close();
        if release.try_recv().is_ok() {
            debug!(scheduler = %self.inner.name, activity = ?self.activity, "Caller left after admission, ending activity");
            self.inner.finish(&self.activity);
        }
    }
}

/// Admits activities in priority order as the policy allows.
///
/// Among requests of equal priority, admission order is unspecified.
pub struct AdmissionScheduler<A> {
    inner: Arc<SchedulerInner<A>>,
    resolution: Arc<ResolutionLoop>,
    handle: Handle,
}

impl<A> AdmissionScheduler<A>
where
    A: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a scheduler named from the loaded config.
    pub fn new<P>(services: &Services, policy: P) -> Self
    where
        P: AdmissionPolicy<A>,
    {
        Self::with_config(services, AdmissionConfig::from_services(services), policy)
    }

    pub fn with_config<P>(services: &Services, config: AdmissionConfig, policy: P) -> Self
    where
        P: AdmissionPolicy<A>,
    {
        let (drained, _) = watch::channel(false);
        let waker = LoopWaker::new();
        let inner = Arc::new(SchedulerInner {
            name: config.name.clone(),
            state: Mutex::new(SchedulerState {
                pending: Vec::new(),
                live: LiveCounts::new(),
                drain_live: false,
                alive: true,
                next_ticket: 0,
            }),
            policy: Box::new(policy),
            waker: waker.clone(),
            drained,
        });

        let driver = inner.clone();
        let resolution = ResolutionLoop::spawn(
            config.name,
            config.loop_config,
            services.handle(),
            waker,
            move || Ok::<_, Error>(driver.admit_next()),
        );

        Self {
            inner,
            resolution: Arc::new(resolution),
            handle: services.handle().clone(),
        }
    }

    /// Wait until `activity` is admitted.
    ///
    /// Returns `Ok(false)` without waiting once the scheduler is draining or
    /// dead, and for requests still pending when a drain completes.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` leaves room for policy errors.
    pub async fn begin_activity(&self, activity: A) -> Result<bool> {
        let Some(mut admission) = self.enqueue(activity) else {
            return Ok(false);
        };
        Ok(admission.admitted().await)
    }

    /// As [`begin_activity`](Self::begin_activity), giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the request was still pending at expiry; the
    /// request is withdrawn. If admission raced the timeout the activity is
    /// running and `Ok(true)` is returned instead.
    pub async fn begin_activity_timeout(&self, activity: A, timeout: Duration) -> Result<bool> {
        let Some(mut admission) = self.enqueue(activity) else {
            return Ok(false);
        };

        if let Ok(admitted) = tokio::time::timeout(timeout, admission.admitted()).await {
            return Ok(admitted);
        }
        if self.inner.withdraw(admission.ticket) {
            return Err(Error::timeout("begin_activity", timeout));
        }
        // Already taken off the queue; the loop is about to release us.
        Ok(admission.admitted().await)
    }

    /// Record that one instance of `activity` finished.
    ///
    /// # Errors
    ///
    /// Returns `IllegalRequest` if no instance of `activity` is running.
    pub fn end_activity(&self, activity: &A) -> Result<()> {
        self.inner.finish(activity).then_some(()).ok_or_illegal(|| {
            format!("{activity:?} ended on '{}' but none is running", self.inner.name)
        })
    }

    /// Refuse new requests, wait for every admitted activity to end, release
    /// leftover callers with `false` and stop the loop.
    ///
    /// Idempotent; concurrent callers all return once the drain completes.
    /// The drain runs on its own task, so cancelling a caller does not abandon
    /// it.
    pub async fn stop_and_drain(&self) {
        let mut drained = self.inner.drained.subscribe();
        let first = std::mem::replace(&mut self.inner.state.lock().alive, false);
        if first {
            info!(scheduler = %self.inner.name, "Draining admission scheduler");
            let sentinel = self.inner.push(Slot::Drain, DRAIN_PRIORITY);
            self.inner.waker.signal_change();

            let inner = self.inner.clone();
            let resolution = self.resolution.clone();
            self.handle.spawn(async move {
                let _ = sentinel.await;
                let released = inner.release_leftovers();
                resolution.stop();
                inner.drained.send_replace(true);
                info!(scheduler = %inner.name, released, "Admission scheduler drained");
            });
        }
        let _ = drained.wait_for(|done| *done).await;
    }

    pub fn is_alive(&self) -> bool {
        self.inner.state.lock().alive
    }

    /// Running instances of `activity`.
    pub fn live_count(&self, activity: &A) -> usize {
        self.inner.state.lock().live.get(activity)
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats<A> {
        let state = self.inner.state.lock();
        SchedulerStats {
            pending: state.pending.len(),
            live: state.live.clone(),
            alive: state.alive,
        }
    }
}

impl<A> AdmissionScheduler<A>
where
    A: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn enqueue(&self, activity: A) -> Option<Admission<A>> {
        let (ticket, release) = self.inner.enqueue(activity.clone())?;
        Some(Admission {
            inner: self.inner.clone(),
            ticket,
            activity,
            release: Some(release),
        })
    }
}

impl<A> SchedulerInner<A>
where
    A: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    fn enqueue(&self, activity: A) -> Option<(u64, oneshot::Receiver<()>)> {
        let priority = self.priority_of(&activity);
        let (release, admitted) = oneshot::channel();
        let ticket = {
            let mut state = self.state.lock();
            if !state.alive {
                debug!(scheduler = %self.name, activity = ?activity, "Request refused, scheduler is draining");
                return None;
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            debug!(scheduler = %self.name, activity = ?activity, priority, ticket, "Activity requested");
            state.pending.push(Pending {
                ticket,
                slot: Slot::Activity(activity),
                priority,
                release,
            });
            ticket
        };
        self.waker.signal_change();
        Some((ticket, admitted))
    }

    /// Queue a request regardless of liveness.
    fn push(&self, slot: Slot<A>, priority: i64) -> oneshot::Receiver<()> {
        let (release, admitted) = oneshot::channel();
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.push(Pending {
            ticket,
            slot,
            priority,
            release,
        });
        admitted
    }

    /// End one running instance. Returns `false` if none was running.
    fn finish(&self, activity: &A) -> bool {
        if !self.state.lock().live.decrement(activity) {
            return false;
        }
        debug!(scheduler = %self.name, activity = ?activity, "Activity ended");
        self.notify_ended(activity);
        self.waker.signal_change();
        true
    }

    /// Drop every request still queued once the sentinel passed; their
    /// callers see `false`.
    fn release_leftovers(&self) -> usize {
        let leftovers = {
            let mut state = self.state.lock();
            state.drain_live = false;
            std::mem::take(&mut state.pending)
        };
        leftovers.len()
    }

    /// Remove a pending request. Returns `false` if it was no longer queued.
    fn withdraw(&self, ticket: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|p| p.ticket != ticket);
        state.pending.len() != before
    }

    fn priority_of(&self, activity: &A) -> i64 {
        match catch_unwind(AssertUnwindSafe(|| self.policy.priority(activity))) {
            Ok(priority) => priority.max(DRAIN_PRIORITY + 1),
            Err(payload) => {
                let fault = Error::transition_fault(&self.name, panic_message(payload.as_ref()));
                warn!(scheduler = %self.name, activity = ?activity, error = %fault, "Priority callback panicked");
                0
            }
        }
    }

    fn may_begin(&self, slot: &Slot<A>, live: &LiveCounts<A>) -> bool {
        let Slot::Activity(activity) = slot else {
            return live.is_empty();
        };
        match catch_unwind(AssertUnwindSafe(|| self.policy.may_begin(activity, live))) {
            Ok(allowed) => allowed,
            Err(payload) => {
                let fault = Error::transition_fault(&self.name, panic_message(payload.as_ref()));
                warn!(scheduler = %self.name, activity = ?activity, error = %fault, "Admission predicate panicked");
                false
            }
        }
    }

    fn notify_ended(&self, activity: &A) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.policy.ended(activity))) {
            warn!(scheduler = %self.name, activity = ?activity, reason = %panic_message(payload.as_ref()), "Ended callback panicked");
        }
    }

    /// One admission cycle.
    fn admit_next(&self) -> Outcome {
        let (candidates, live) = {
            let mut state = self.state.lock();
            if state.drain_live {
                return Outcome::Done;
            }
            state.pending.retain(|p| !p.release.is_closed());
            state.pending.sort_unstable_by(|a, b| b.priority.cmp(&a.priority));
            let candidates: Vec<(u64, Slot<A>)> = state
                .pending
                .iter()
                .map(|p| (p.ticket, p.slot.clone()))
                .collect();
            (candidates, state.live.clone())
        };

        let Some(ticket) = candidates
            .iter()
            .find(|(_, slot)| self.may_begin(slot, &live))
            .map(|(ticket, _)| *ticket)
        else {
            return Outcome::Done;
        };

        let admitted = {
            let mut state = self.state.lock();
            let Some(pos) = state.pending.iter().position(|p| p.ticket == ticket) else {
                // Withdrawn meanwhile; look again.
                return Outcome::RetryNow;
            };
            let entry = state.pending.remove(pos);
            match &entry.slot {
                Slot::Activity(activity) => state.live.increment(activity),
                Slot::Drain => state.drain_live = true,
            }
            entry
        };

        let Pending { slot, release, priority, .. } = admitted;
        if let Slot::Activity(activity) = &slot {
            debug!(scheduler = %self.name, activity = ?activity, priority, "Activity admitted");
            if let Err(payload) =
                catch_unwind(AssertUnwindSafe(|| self.policy.about_to_begin(activity)))
            {
                warn!(scheduler = %self.name, activity = ?activity, reason = %panic_message(payload.as_ref()), "About-to-begin callback panicked");
            }
        }

        if release.send(()).is_err() {
            // Caller gave up between the snapshot and the release.
            match &slot {
                Slot::Activity(activity) => {
                    self.state.lock().live.decrement(activity);
                    self.notify_ended(activity);
                }
                Slot::Drain => self.state.lock().drain_live = false,
            }
        }
        Outcome::RetryNow
    }
}
