use async_trait::async_trait;
use cadence::{
    BufferedUdpMetricSink, Counted, CountedExt, Gauged, Metric, QueuingMetricSink, StatsdClient,
    Timed,
};
use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Publishes counters, gauges, and timings for the pipeline.
///
/// One publisher is built at startup and handed to every component that
/// reports; nothing reaches for a process-wide registry.
#[async_trait]
pub trait MetricsPublisher: Send + Sync {
    /// Increment a counter by 1
    async fn incr(&self, key: &str);

    /// Increment a counter by a specific value
    async fn count(&self, key: &str, value: u64);

    /// Increment a counter with tags
    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]);

    /// Record a gauge value
    async fn gauge(&self, key: &str, value: u64);

    /// Record a gauge value with tags
    async fn gauge_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]);

    /// Record a timing in milliseconds
    async fn time(&self, key: &str, millis: u64);

    /// Record a timing with tags
    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]);
}

/// No-op implementation for development and testing
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsPublisher;

impl NoOpMetricsPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MetricsPublisher for NoOpMetricsPublisher {
    async fn incr(&self, _key: &str) {}
    async fn count(&self, _key: &str, _value: u64) {}
    async fn incr_with_tags(&self, _key: &str, _tags: &[(&str, &str)]) {}
    async fn gauge(&self, _key: &str, _value: u64) {}
    async fn gauge_with_tags(&self, _key: &str, _value: u64, _tags: &[(&str, &str)]) {}
    async fn time(&self, _key: &str, _millis: u64) {}
    async fn time_with_tags(&self, _key: &str, _millis: u64, _tags: &[(&str, &str)]) {}
}

/// Statsd-backed metrics publisher using cadence
pub struct StatsdMetricsPublisher {
    client: StatsdClient,
}

impl StatsdMetricsPublisher {
    pub fn new(host: &str, prefix: &str) -> Result<Self, MetricsError> {
        tracing::info!(host = %host, prefix = %prefix, "Creating statsd metrics publisher");

        let socket = UdpSocket::bind("[::]:0")
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;

        let buffered_sink = BufferedUdpMetricSink::from(host, socket)
            .map_err(|e| MetricsError::CreationFailed(e.to_string()))?;
        let queuing_sink = QueuingMetricSink::builder()
            .with_error_handler(move |error| {
                error!("Failed to send metric via sink: {}", error);
            })
            .build(buffered_sink);

        Ok(Self {
            client: StatsdClient::from_sink(prefix, queuing_sink),
        })
    }

    fn send_tagged<'a, M>(mut builder: cadence::MetricBuilder<'a, 'a, M>, tags: &'a [(&str, &str)])
    where
        M: Metric + From<String>,
    {
        for (k, v) in tags {
            builder = builder.with_tag(k, v);
        }
        builder.send();
    }
}

#[async_trait]
impl MetricsPublisher for StatsdMetricsPublisher {
    async fn incr(&self, key: &str) {
        if let Err(e) = self.client.incr(key) {
            debug!("Failed to send metric {}: {}", key, e);
        }
    }

    async fn count(&self, key: &str, value: u64) {
        let _ = self.client.count(key, value);
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        Self::send_tagged(self.client.incr_with_tags(key), tags);
    }

    async fn gauge(&self, key: &str, value: u64) {
        let _ = self.client.gauge(key, value);
    }

    async fn gauge_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        Self::send_tagged(self.client.gauge_with_tags(key, value), tags);
    }

    async fn time(&self, key: &str, millis: u64) {
        let _ = self.client.time(key, millis);
    }

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]) {
        Self::send_tagged(self.client.time_with_tags(key, millis), tags);
    }
}

/// Pull-based publisher backing the diagnostics `/metrics` endpoint.
///
/// Metric families are registered lazily on first use. A key reused with a
/// different tag set is dropped with a warning since Prometheus families have
/// a fixed label schema.
pub struct PrometheusMetricsPublisher {
    registry: Registry,
    prefix: String,
    counters: Mutex<HashMap<String, Option<IntCounterVec>>>,
    gauges: Mutex<HashMap<String, Option<IntGaugeVec>>>,
    timings: Mutex<HashMap<String, Option<HistogramVec>>>,
}

impl PrometheusMetricsPublisher {
    pub fn new(prefix: &str) -> Self {
        Self {
            registry: Registry::new(),
            prefix: prefix.to_string(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            timings: Mutex::new(HashMap::new()),
        }
    }

    fn family_name(&self, key: &str) -> String {
        let key = key.replace(['.', '-', '/'], "_");
        if self.prefix.is_empty() {
            key
        } else {
            format!("{}_{}", self.prefix, key)
        }
    }

    fn family_key(name: &str, tags: &[(&str, &str)]) -> String {
        let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
        format!("{}|{}", name, labels.join(","))
    }

    fn register<C>(&self, name: &str, build: impl FnOnce() -> prometheus::Result<C>) -> Option<C>
    where
        C: prometheus::core::Collector + Clone + 'static,
    {
        let collector = match build() {
            Ok(collector) => collector,
            Err(e) => {
                warn!(metric = %name, error = ?e, "Invalid metric definition");
                return None;
            }
        };
        match self.registry.register(Box::new(collector.clone())) {
            Ok(()) => Some(collector),
            Err(e) => {
                warn!(metric = %name, error = ?e, "Metric family conflicts with an existing one");
                None
            }
        }
    }

    fn counter(&self, key: &str, tags: &[(&str, &str)]) -> Option<IntCounterVec> {
        let name = self.family_name(key);
        let mut counters = self.counters.lock();
        counters
            .entry(Self::family_key(&name, tags))
            .or_insert_with(|| {
                let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
                self.register(&name, || IntCounterVec::new(Opts::new(name.as_str(), key), &labels))
            })
            .clone()
    }

    fn gauge_vec(&self, key: &str, tags: &[(&str, &str)]) -> Option<IntGaugeVec> {
        let name = self.family_name(key);
        let mut gauges = self.gauges.lock();
        gauges
            .entry(Self::family_key(&name, tags))
            .or_insert_with(|| {
                let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
                self.register(&name, || IntGaugeVec::new(Opts::new(name.as_str(), key), &labels))
            })
            .clone()
    }

    fn histogram(&self, key: &str, tags: &[(&str, &str)]) -> Option<HistogramVec> {
        let name = format!("{}_seconds", self.family_name(key));
        let mut timings = self.timings.lock();
        timings
            .entry(Self::family_key(&name, tags))
            .or_insert_with(|| {
                let labels: Vec<&str> = tags.iter().map(|(k, _)| *k).collect();
                self.register(&name, || {
                    HistogramVec::new(HistogramOpts::new(name.as_str(), key), &labels)
                })
            })
            .clone()
    }

    fn label_values<'a>(tags: &'a [(&'a str, &'a str)]) -> Vec<&'a str> {
        tags.iter().map(|(_, v)| *v).collect()
    }

    /// Render every registered family in the Prometheus text format.
    pub fn render(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::RenderFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::RenderFailed(e.to_string()))
    }
}

#[async_trait]
impl MetricsPublisher for PrometheusMetricsPublisher {
    async fn incr(&self, key: &str) {
        self.count_with_tags(key, 1, &[]);
    }

    async fn count(&self, key: &str, value: u64) {
        self.count_with_tags(key, value, &[]);
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        self.count_with_tags(key, 1, tags);
    }

    async fn gauge(&self, key: &str, value: u64) {
        self.gauge_with_tags(key, value, &[]).await;
    }

    async fn gauge_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        if let Some(gauge) = self.gauge_vec(key, tags) {
            gauge
                .with_label_values(&Self::label_values(tags))
                .set(value as i64);
        }
    }

    async fn time(&self, key: &str, millis: u64) {
        self.time_with_tags(key, millis, &[]).await;
    }

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]) {
        if let Some(histogram) = self.histogram(key, tags) {
            histogram
                .with_label_values(&Self::label_values(tags))
                .observe(millis as f64 / 1000.0);
        }
    }
}

impl PrometheusMetricsPublisher {
    fn count_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        if let Some(counter) = self.counter(key, tags) {
            counter
                .with_label_values(&Self::label_values(tags))
                .inc_by(value);
        }
    }
}

/// Sends every metric to each of the wrapped publishers.
pub struct FanoutMetricsPublisher {
    publishers: Vec<SharedMetricsPublisher>,
}

impl FanoutMetricsPublisher {
    pub fn new(publishers: Vec<SharedMetricsPublisher>) -> Self {
        Self { publishers }
    }
}

#[async_trait]
impl MetricsPublisher for FanoutMetricsPublisher {
    async fn incr(&self, key: &str) {
        for publisher in &self.publishers {
            publisher.incr(key).await;
        }
    }

    async fn count(&self, key: &str, value: u64) {
        for publisher in &self.publishers {
            publisher.count(key, value).await;
        }
    }

    async fn incr_with_tags(&self, key: &str, tags: &[(&str, &str)]) {
        for publisher in &self.publishers {
            publisher.incr_with_tags(key, tags).await;
        }
    }

    async fn gauge(&self, key: &str, value: u64) {
        for publisher in &self.publishers {
            publisher.gauge(key, value).await;
        }
    }

    async fn gauge_with_tags(&self, key: &str, value: u64, tags: &[(&str, &str)]) {
        for publisher in &self.publishers {
            publisher.gauge_with_tags(key, value, tags).await;
        }
    }

    async fn time(&self, key: &str, millis: u64) {
        for publisher in &self.publishers {
            publisher.time(key, millis).await;
        }
    }

    async fn time_with_tags(&self, key: &str, millis: u64, tags: &[(&str, &str)]) {
        for publisher in &self.publishers {
            publisher.time_with_tags(key, millis, tags).await;
        }
    }
}

/// Type alias for shared metrics publisher
pub type SharedMetricsPublisher = Arc<dyn MetricsPublisher>;

/// Metrics-specific errors
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("error-automod-metrics-1 Failed to create metrics publisher: {0}")]
    CreationFailed(String),

    #[error("error-automod-metrics-2 Failed to render metrics: {0}")]
    RenderFailed(String),
}

/// Build the publisher handed to every component.
///
/// Prometheus is always present for the diagnostics endpoint; statsd is added
/// when a host is configured.
pub fn create_metrics_publisher(
    prometheus: Arc<PrometheusMetricsPublisher>,
    statsd_host: Option<&str>,
    prefix: &str,
) -> Result<SharedMetricsPublisher, MetricsError> {
    match statsd_host {
        Some(host) => {
            let statsd = StatsdMetricsPublisher::new(host, prefix)?;
            Ok(Arc::new(FanoutMetricsPublisher::new(vec![
                prometheus,
                Arc::new(statsd),
            ])))
        }
        None => Ok(prometheus),
    }
}

/// Helper struct for timing operations
pub struct MetricTimer {
    start: std::time::Instant,
    metric: &'static str,
    publisher: SharedMetricsPublisher,
}

impl MetricTimer {
    pub fn new(metric: &'static str, publisher: SharedMetricsPublisher) -> Self {
        Self {
            start: std::time::Instant::now(),
            metric,
            publisher,
        }
    }

    pub async fn record(self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.publisher.time(self.metric, elapsed).await;
    }
}
