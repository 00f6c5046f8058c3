use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Json},
};
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::{Value, json};

use super::context::DiagnosticsContext;
use super::errors::WebError;

pub(super) async fn handle_health(State(context): State<DiagnosticsContext>) -> Json<Value> {
    Json(json!({
        "version": context.version,
        "status": "ok",
    }))
}

pub(super) async fn handle_stats(State(context): State<DiagnosticsContext>) -> Json<Value> {
    let scheduler = context.pool.scheduler();
    let cursor = context.firehose_cursor();

    let ozone = context.ozone_cursor.as_ref().map(|cursor| {
        json!({
            "cursor": cursor
                .current()
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        })
    });

    Json(json!({
        "pending": scheduler.pending(),
        "workers": context.pool.size(),
        "active_workers": scheduler.active_workers(),
        "ready_repos": scheduler.ready_repos(),
        "queues": scheduler.queue_count(),
        "firehose": {
            "last_claimed": cursor.last_claimed(),
            "safe_sequence": cursor.safe_sequence(),
            "in_flight": cursor.in_flight(),
            "last_persisted": cursor.last_persisted(),
            "persisted_at": cursor
                .persisted_at()
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        },
        "ozone": ozone,
    }))
}

pub(super) async fn handle_metrics(
    State(context): State<DiagnosticsContext>,
) -> Result<impl IntoResponse, WebError> {
    let body = context.prometheus.render()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// Must finish inside the router's request timeout.
const MAX_PROFILE_SECONDS: u64 = 8;
const PROFILE_FREQUENCY: i32 = 99;

#[derive(Debug, Deserialize)]
pub(super) struct ProfileParams {
    seconds: Option<u64>,
}

/// Sample the whole process for a few seconds and return a flamegraph SVG.
pub(super) async fn handle_cpu_profile(
    Query(params): Query<ProfileParams>,
) -> Result<impl IntoResponse, WebError> {
    let seconds = params.seconds.unwrap_or(5).clamp(1, MAX_PROFILE_SECONDS);
    tracing::info!(seconds, "Capturing CPU profile");

    let svg = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, pprof::Error> {
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(PROFILE_FREQUENCY)
            .blocklist(&["libc", "libgcc", "pthread", "vdso"])
            .build()?;
        std::thread::sleep(Duration::from_secs(seconds));
        let report = guard.report().build()?;
        let mut svg = Vec::new();
        report.flamegraph(&mut svg)?;
        Ok(svg)
    })
    .await??;

    Ok(([(CONTENT_TYPE, "image/svg+xml")], svg))
}

/// Tokio runtime counters alongside the scheduler's own view of its work.
pub(super) async fn handle_runtime(State(context): State<DiagnosticsContext>) -> Json<Value> {
    let metrics = tokio::runtime::Handle::current().metrics();
    let scheduler = context.pool.scheduler();

    Json(json!({
        "runtime": {
            "workers": metrics.num_workers(),
            "alive_tasks": metrics.num_alive_tasks(),
            "global_queue_depth": metrics.global_queue_depth(),
        },
        "scheduler": {
            "pool_size": context.pool.size(),
            "active_workers": scheduler.active_workers(),
            "ready_repos": scheduler.ready_repos(),
            "queues": scheduler.queue_count(),
            "pending": scheduler.pending(),
        },
    }))
}
