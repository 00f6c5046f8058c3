//! Background task lifecycle.
//!
//! Every long-running loop in the daemon (firehose consumer, cursor persist
//! loops, auto-scaler, Ozone consumer, diagnostics server) is spawned through
//! [`manager`] onto one `TaskTracker` and shares one cancellation token. A
//! task that fails cancels the token, which shuts the rest down.

pub mod manager;

pub use manager::{spawn_cancellable_task, spawn_managed_task};
