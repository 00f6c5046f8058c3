//! Diagnostics endpoint.
//!
//! - `GET /_health`: version and status
//! - `GET /_stats`: scheduler depth, worker counts, and cursor positions
//! - `GET /metrics`: Prometheus text exposition
//! - `GET /debug/runtime`: tokio runtime counters and scheduler state
//! - `GET /debug/pprof/profile?seconds=N`: CPU profile as a flamegraph SVG

pub mod context;
mod errors;
mod handle_diagnostics;
pub mod server;

pub use context::DiagnosticsContext;
pub use server::build_router;
