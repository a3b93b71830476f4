//! Delay policies consulted when a machine has not yet converged.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// Delay table: global, per-state and per-(state, goal) entries.
///
/// Resolution picks the most specific entry that exists: the pair entry,
/// then the state entry, then the global one. No entry means "wait until
/// prompted".
#[derive(Debug, Clone)]
pub struct Behaviors<S> {
    global: Option<Duration>,
    per_state: HashMap<S, Duration>,
    per_pair: HashMap<(S, S), Duration>,
}

impl<S> Default for Behaviors<S> {
    fn default() -> Self {
        Self {
            global: None,
            per_state: HashMap::new(),
            per_pair: HashMap::new(),
        }
    }
}

impl<S> Behaviors<S>
where
    S: Clone + Eq + Hash + Debug,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay to wait in `state` while heading for `goal`.
    pub fn resolve(&self, state: &S, goal: &S) -> Option<Duration> {
        self.per_pair
            .get(&(state.clone(), goal.clone()))
            .or_else(|| self.per_state.get(state))
            .copied()
            .or(self.global)
    }

    pub fn set_global(&mut self, delay: Option<Duration>) {
        self.global = delay;
    }

    pub fn set_state(&mut self, state: S, delay: Option<Duration>) {
        match delay {
            Some(delay) => {
                self.per_state.insert(state, delay);
            }
            None => {
                self.per_state.remove(&state);
            }
        }
    }

    pub fn set_pair(&mut self, state: S, goal: S, delay: Option<Duration>) {
        match delay {
            Some(delay) => {
                self.per_pair.insert((state, goal), delay);
            }
            None => {
                self.per_pair.remove(&(state, goal));
            }
        }
    }

    pub const fn global(&self) -> Option<Duration> {
        self.global
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.per_state.is_empty() && self.per_pair.is_empty()
    }
}
