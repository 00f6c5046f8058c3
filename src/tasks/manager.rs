use std::future::Future;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Spawn a task that owns its own shutdown handling.
///
/// The task receives no token; it is expected to watch one it already holds
/// and return once it has finished draining. Failure cancels `app_token`.
pub fn spawn_managed_task<F>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_future: F,
) where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting background task");

    tracker.spawn(async move {
        match task_future.await {
            Ok(()) => {
                info!(task = task_name, "Background task completed");
            }
            Err(e) => {
                error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                app_token.cancel();
            }
        }
    });
}

/// Spawn a task that is dropped as soon as `app_token` is cancelled.
///
/// The builder receives a child of `app_token` for loops that want to notice
/// cancellation between steps. Failure cancels `app_token`.
pub fn spawn_cancellable_task<F, Fut>(
    tracker: &TaskTracker,
    app_token: CancellationToken,
    task_name: &'static str,
    task_builder: F,
) where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    info!(task = task_name, "Starting cancellable background task");

    let cancel_token = app_token.child_token();

    tracker.spawn(async move {
        tokio::select! {
            result = task_builder(cancel_token) => {
                match result {
                    Ok(()) => {
                        info!(task = task_name, "Background task completed");
                    }
                    Err(e) => {
                        error!(task = task_name, error = ?e, "Background task failed unexpectedly");
                        app_token.cancel();
                    }
                }
            }
            () = app_token.cancelled() => {
                info!(task = task_name, "Background task shutting down");
            }
        }
    });
}
