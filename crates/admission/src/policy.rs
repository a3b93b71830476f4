//! Admission policies: who goes first and who may start at all.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

/// Running instances per activity.
#[derive(Debug, Clone)]
pub struct LiveCounts<A> {
    counts: HashMap<A, usize>,
    total: usize,
}

impl<A> Default for LiveCounts<A> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            total: 0,
        }
    }
}

impl<A> LiveCounts<A>
where
    A: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Running instances of `activity`.
    pub fn get(&self, activity: &A) -> usize {
        self.counts.get(activity).copied().unwrap_or(0)
    }

    /// Running instances across all activities.
    pub const fn total(&self) -> usize {
        self.total
    }

    pub const fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&A, usize)> {
        self.counts.iter().map(|(activity, count)| (activity, *count))
    }

    pub(crate) fn increment(&mut self, activity: &A) {
        *self.counts.entry(activity.clone()).or_insert(0) += 1;
        self.total += 1;
    }

    /// Returns `false` if nothing was running.
    pub(crate) fn decrement(&mut self, activity: &A) -> bool {
        let Some(count) = self.counts.get_mut(activity) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(activity);
        }
        self.total -= 1;
        true
    }
}

/// Decides ordering and admission of activities.
///
/// Callbacks run without the scheduler's lock held but must not call back
/// into the scheduler synchronously.
pub trait AdmissionPolicy<A>: Send + Sync + 'static {
    /// Priority for a new request; higher goes first.
    fn priority(&self, activity: &A) -> i64;

    /// Whether `activity` may start given what is running now.
    fn may_begin(&self, activity: &A, live: &LiveCounts<A>) -> bool;

    /// Called once an activity has been admitted, before its caller resumes.
    fn about_to_begin(&self, _activity: &A) {}

    /// Called after an activity ended.
    fn ended(&self, _activity: &A) {}
}

/// Concurrency caps and fixed priorities per activity.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimits<A> {
    limits: HashMap<A, usize>,
    priorities: HashMap<A, i64>,
    default_limit: Option<usize>,
    default_priority: i64,
    total_limit: Option<usize>,
}

impl<A> Default for ConcurrencyLimits<A> {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            priorities: HashMap::new(),
            default_limit: None,
            default_priority: 0,
            total_limit: None,
        }
    }
}

impl<A> ConcurrencyLimits<A>
where
    A: Eq + Hash,
{
    /// No caps, every activity at priority zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap concurrent instances of `activity`.
    #[must_use]
    pub fn with_limit(mut self, activity: A, limit: usize) -> Self {
        self.limits.insert(activity, limit);
        self
    }

    #[must_use]
    pub fn with_priority(mut self, activity: A, priority: i64) -> Self {
        self.priorities.insert(activity, priority);
        self
    }

    /// Cap for activities without their own limit.
    #[must_use]
    pub const fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = Some(limit);
        self
    }

    /// Priority for activities without their own.
    #[must_use]
    pub const fn with_default_priority(mut self, priority: i64) -> Self {
        self.default_priority = priority;
        self
    }

    /// Cap on all running activities together.
    #[must_use]
    pub const fn with_total_limit(mut self, limit: usize) -> Self {
        self.total_limit = Some(limit);
        self
    }
}

impl<A> AdmissionPolicy<A> for ConcurrencyLimits<A>
where
    A: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn priority(&self, activity: &A) -> i64 {
        self.priorities
            .get(activity)
            .copied()
            .unwrap_or(self.default_priority)
    }

    fn may_begin(&self, activity: &A, live: &LiveCounts<A>) -> bool {
        let under_total = self.total_limit.is_none_or(|cap| live.total() < cap);
        let under_own = self
            .limits
            .get(activity)
            .copied()
            .or(self.default_limit)
            .is_none_or(|cap| live.get(activity) < cap);
        under_total && under_own
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn live_counts_track_totals() {
        let mut live = LiveCounts::new();
        live.increment(&"upload");
        live.increment(&"upload");
        live.increment(&"scan");
        assert_eq!(live.get(&"upload"), 2);
        assert_eq!(live.total(), 3);

        assert!(live.decrement(&"upload"));
        assert!(live.decrement(&"scan"));
        assert!(!live.decrement(&"scan"));
        assert_eq!(live.get(&"scan"), 0);
        assert_eq!(live.total(), 1);
        assert_eq!(live.iter().collect::<Vec<_>>(), vec![(&"upload", 1)]);
    }

    #[test]
    fn limits_cap_each_activity_and_the_total() {
        let policy = ConcurrencyLimits::new()
            .with_limit("upload", 1)
            .with_default_limit(2)
            .with_total_limit(3);
        let mut live = LiveCounts::new();

        assert!(policy.may_begin(&"upload", &live));
        live.increment(&"upload");
        assert!(!policy.may_begin(&"upload", &live));

        assert!(policy.may_begin(&"scan", &live));
        live.increment(&"scan");
        live.increment(&"scan");
        assert!(!policy.may_begin(&"scan", &live), "default limit reached");
        assert!(!policy.may_begin(&"index", &live), "total limit reached");
    }

    #[test]
    fn priorities_fall_back_to_default() {
        let policy = ConcurrencyLimits::new()
            .with_priority("urgent", 10)
            .with_default_priority(-1);
        assert_eq!(policy.priority(&"urgent"), 10);
        assert_eq!(policy.priority(&"other"), -1);
    }
}
