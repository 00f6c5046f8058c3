use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::metrics::MetricsError;

#[derive(Debug, thiserror::Error)]
pub(super) enum WebError {
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("error-automod-web-1 Profiling failed: {0}")]
    Profile(#[from] pprof::Error),

    #[error("error-automod-web-2 Profiler task failed: {0}")]
    ProfileTask(#[from] tokio::task::JoinError),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        match self {
            WebError::Metrics(err) => {
                tracing::error!(error = %err, "Failed to render metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
            err @ (WebError::Profile(_) | WebError::ProfileTask(_)) => {
                tracing::error!(error = %err, "Failed to capture CPU profile");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}
