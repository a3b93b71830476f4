//! Reactive reconciliation for goal-seeking state machines.
//!
//! - **Resolution loop**: one worker per entity invoking a progress callback
//!   until it reports there is nothing left to do
//! - **State machine**: current state, desired goal and a transition function,
//!   with delay policies deciding how soon to retry
//! - **Lifecycle hooks**: enter, exit and periodic callbacks delivered off the
//!   caller's stack
//! - **Meta-goals**: a higher-level goal resolved into an AND/OR combination of
//!   sub-machine goals
//!
//! # Example
//!
//! ```ignore
//! use settle_events::Services;
//! use settle_reconciler::StateMachine;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let services = Services::current().unwrap();
//!     let machine = StateMachine::builder(0u32)
//!         .name("counter")
//!         .transition(|state, goal| Ok((state < goal).then(|| state + 1)))
//!         .global_delay(Duration::from_millis(10))
//!         .build(&services)
//!         .unwrap();
//!
//!     machine.set_goal(5);
//!     machine.block_until_goal_reached(None).await.unwrap();
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod behavior;
pub mod hooks;
pub mod r#loop;
pub mod machine;
pub mod meta;

pub use behavior::Behaviors;
pub use hooks::{HookEvent, HookFn, HookId, HookKind, HookRegistry, HooksConfig};
pub use machine::{MachineSnapshot, StateMachine, StateMachineBuilder, TransitionFn};
pub use meta::{
    Combinator, CompletionReport, Engagement, MetaGoalComposer, Resolver, Step, SubGoal,
};
pub use r#loop::{LoopConfig, LoopStats, LoopWaker, Outcome, Progress, ResolutionLoop};
pub use settle_core::{Error, Result};
