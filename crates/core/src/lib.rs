//! Core types, errors, and configuration for settle.
//!
//! All errors are explicit, typed, and recoverable. Failures raised by user
//! callbacks are contained by the components that invoke them; this crate only
//! names them.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod error;
pub mod result;

pub use config::{AdmissionSettings, HookSettings, HubSettings, ResolutionSettings, SettleConfig};
pub use error::{BoxError, Error, panic_message};
pub use result::{OptionExt, Result, ResultExt};
