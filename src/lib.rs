//! # automod
//!
//! automod is an automated moderation daemon for the AT Protocol. It consumes
//! the relay firehose, evaluates a fixed ruleset against every event, and turns
//! the resulting effects into moderation actions (labels, reports, flags,
//! takedowns, and notifications) against Ozone, the account host, and Slack.
//!
//! ## Architecture Overview
//!
//! ### Firehose
//! - A single websocket connection to `com.atproto.sync.subscribeRepos`
//! - Frames are decoded (DAG-CBOR header and payload, CAR blocks for commits)
//!   into [`event::FirehoseEvent`]s
//! - Reconnects with exponential backoff and resumes from the last claimed sequence
//!
//! ### Scheduler
//! - One FIFO queue per repository; events for the same account never overlap
//! - A worker pool, fixed or auto-scaled, drains ready repositories
//! - Bounded pending counts apply backpressure to the consumer
//!
//! ### Rules and Dispatch
//! - A ruleset is chosen at startup and evaluated per event by [`engine::RulesetEngine`]
//! - [`dispatch::ActionDispatcher`] applies effects with bounded retries,
//!   deduplication, and optional rerouting to other moderation services
//!
//! ### Cursors
//! - The persisted firehose cursor never passes an event that has not finished
//! - Redis, file, or in-memory stores
//!
//! ## Configuration
//!
//! The service is configured via environment variables. Key variables include:
//! - `ATP_RELAY_HOST`: Relay websocket base
//! - `OZONE_ADMIN_TOKEN` / `OZONE_DID`: Enable Ozone actions
//! - `REDIS_URL`: Redis connection (optional, enables shared cursors and identity cache)
//! - `RULESET`: `default`, `no-blobs`, or `only-blobs`
//!
//! ## Error Handling
//!
//! All error strings use the format: `error-automod-<domain>-<number> <message>: <details>`

/// One-shot record fetching for the `process-*` and `capture-recent` commands.
pub mod capture;

/// Configuration management for the automod service.
///
/// Every setting is read from the environment once at startup and validated
/// before anything connects.
pub mod config;

/// Durable cursors for the firehose and the moderation-event stream.
pub mod cursor;

/// Effect application against moderation, account host, and notification services.
pub mod dispatch;

/// Ruleset evaluation.
pub mod engine;

pub mod errors;

pub mod event;

/// Relay firehose consumer and frame decoding.
pub mod firehose;

/// Diagnostics HTTP endpoints.
pub mod http;

/// Identity resolution and caching for AT Protocol DIDs and handles.
pub mod identity;

/// Metrics collection for service observability.
///
/// Publishers are passed explicitly to every component.
pub mod metrics;

/// Moderation-event reroute consumer.
pub mod ozone;

/// Per-event worker pipeline.
pub mod processor;

/// Per-repository queues and the worker pool.
pub mod scheduler;

/// Background task management.
pub mod tasks;

#[cfg(test)]
pub mod test_helpers;
