#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # settle
//!
//! Reactive reconciliation core: goal-driven state machines converging toward
//! a desired state, lifecycle hooks, meta-goals composed from sub-machine
//! goals, and priority admission control with graceful drain.
//!
//! This library re-exports the workspace crates for convenience.

pub use settle_admission as admission;
pub use settle_events as events;
pub use settle_reconciler as reconciler;

pub mod logging;
pub mod prelude;

pub use settle_admission::{AdmissionScheduler, ConcurrencyLimits};
pub use settle_core::{Error, Result, SettleConfig};
pub use settle_events::Services;
pub use settle_reconciler::{MetaGoalComposer, StateMachine, Step};
