//! Admission control: callers wait for permission to begin an activity.
//!
//! A policy assigns each request a priority and decides, given what is
//! already running, whether it may start. Waiting requests are admitted in
//! descending priority order. `stop_and_drain` refuses new requests, waits for
//! running activities to finish and releases anyone still waiting.
//!
//! # Example
//!
//! ```ignore
//! use settle_admission::{AdmissionScheduler, ConcurrencyLimits};
//! use settle_events::Services;
//!
//! #[tokio::main]
//! async fn main() {
//!     let services = Services::current().unwrap();
//!     let scheduler = AdmissionScheduler::new(
//!         &services,
//!         ConcurrencyLimits::new().with_limit("upload", 2).with_priority("upload", 5),
//!     );
//!
//!     if scheduler.begin_activity("upload").await.unwrap() {
//!         // ... do the upload ...
//!         scheduler.end_activity(&"upload").unwrap();
//!     }
//!     scheduler.stop_and_drain().await;
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod policy;
pub mod scheduler;

pub use policy::{AdmissionPolicy, ConcurrencyLimits, LiveCounts};
pub use scheduler::{AdmissionConfig, AdmissionScheduler, SchedulerStats};
