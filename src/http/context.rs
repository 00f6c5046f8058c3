use std::{ops::Deref, sync::Arc};

use crate::cursor::{StreamCursor, TimestampCursor};
use crate::metrics::PrometheusMetricsPublisher;
use crate::scheduler::WorkerPool;

pub struct InnerDiagnosticsContext {
    pub(crate) version: String,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) ozone_cursor: Option<Arc<TimestampCursor>>,
    pub(crate) prometheus: Arc<PrometheusMetricsPublisher>,
}

/// Shared state for the diagnostics endpoints. Read-only views of the pipeline.
#[derive(Clone)]
pub struct DiagnosticsContext(pub(crate) Arc<InnerDiagnosticsContext>);

impl Deref for DiagnosticsContext {
    type Target = InnerDiagnosticsContext;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DiagnosticsContext {
    pub fn new(
        version: &str,
        pool: Arc<WorkerPool>,
        ozone_cursor: Option<Arc<TimestampCursor>>,
        prometheus: Arc<PrometheusMetricsPublisher>,
    ) -> Self {
        Self(Arc::new(InnerDiagnosticsContext {
            version: version.to_string(),
            pool,
            ozone_cursor,
            prometheus,
        }))
    }

    pub(crate) fn firehose_cursor(&self) -> &Arc<StreamCursor> {
        self.pool.scheduler().cursor()
    }
}
