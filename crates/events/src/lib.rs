//! Execution collaborators for settle components.
//!
//! - **Task runner**: runs submitted callbacks off the caller's stack
//! - **Timer service**: one-shot and repeating timers with cancel and reset
//! - **Event hub**: ordered topic pub/sub with per-listener circuit breakers
//! - **Services**: the bundle handed to machines, composers and schedulers
//!
//! # Example
//!
//! ```ignore
//! use settle_events::{Services, SubscribeOptions};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let services = Services::current().unwrap();
//!     let hub = services.event_hub::<&str, u32>("demo");
//!     hub.subscribe("ticks", Arc::new(|n| println!("tick {n}")), SubscribeOptions::ordered());
//!     hub.publish("ticks", 1);
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod hub;
pub mod runner;
pub mod services;
pub mod timer;

pub use hub::{
    CircuitBreaker, EventHub, EventHubBuilder, HubConfig, Listener, SubscribeOptions,
    SubscriptionId,
};
pub use runner::{Task, TaskHandle, TaskRunner, TokioTaskRunner};
pub use services::Services;
pub use timer::{TimerCallback, TimerHandle, TimerId, TimerService, TimerStatus, TokioTimerService};
