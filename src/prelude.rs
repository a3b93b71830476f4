//! Prelude module - common imports for settle users
//!
//! ```rust
//! use settle::prelude::*;
//! ```

pub use settle_admission::{AdmissionPolicy, AdmissionScheduler, ConcurrencyLimits, LiveCounts};
pub use settle_core::{BoxError, Error, OptionExt, Result, ResultExt, SettleConfig};
pub use settle_events::Services;
pub use settle_reconciler::{
    HookEvent, HookId, HookKind, MetaGoalComposer, Outcome, StateMachine, Step, SubGoal,
};
