use std::time::Duration;

use axum::{Router, http::Request, http::Response, http::StatusCode, routing::get};
use tower_http::trace::TraceLayer;
use tower_http::{classify::ServerErrorsFailureClass, timeout::TimeoutLayer};
use tracing::Span;

use crate::http::{
    context::DiagnosticsContext,
    handle_diagnostics::{
        handle_cpu_profile, handle_health, handle_metrics, handle_runtime, handle_stats,
    },
};

pub fn build_router(context: DiagnosticsContext) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::debug_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_request(|_request: &Request<_>, _span: &Span| {})
        .on_response(|response: &Response<_>, latency: Duration, _span: &Span| {
            tracing::debug!(
                status = response.status().as_u16(),
                latency_ms = latency.as_millis(),
                "finished processing request"
            );
        })
        .on_failure(
            |err: ServerErrorsFailureClass, latency: Duration, _span: &Span| {
                tracing::error!(
                    error = ?err,
                    latency_ms = latency.as_millis(),
                    "request failed"
                );
            },
        );

    Router::new()
        .route("/_health", get(handle_health))
        .route("/_stats", get(handle_stats))
        .route("/metrics", get(handle_metrics))
        .route("/debug/runtime", get(handle_runtime))
        .route("/debug/pprof/profile", get(handle_cpu_profile))
        .layer((
            trace_layer,
            TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)),
        ))
        .with_state(context)
}
