//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::identity::Identity;

// Test environment mutex to prevent concurrent environment variable modification
pub static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub fn test_identity(did: &str, handle: &str) -> Identity {
    Identity {
        did: did.to_string(),
        handle: Some(handle.to_string()),
        pds_endpoint: Some("https://pds.test".to_string()),
        also_known_as: vec![format!("at://{}", handle)],
        verification_keys: vec![],
        resolved_at: Utc::now(),
    }
}

/// Records every metric in memory so tests can assert on them.
#[derive(Default)]
pub struct MockMetricsPublisher {
    pub counters: Arc<Mutex<HashMap<String, u64>>>,
    pub gauges: Arc<Mutex<HashMap<String, u64>>>,
    pub timings: Arc<Mutex<HashMap<String, Vec<u64>>>>,
}

impl MockMetricsPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_counter(&self, key: &str) -> u64 {
        self.counters.lock().get(key).copied().unwrap_or(0)
    }

    pub fn get_gauge(&self, key: &str) -> u64 {
        self.gauges.lock().get(key).copied().unwrap_or(0)
    }

    pub fn get_timings(&self, key: &str) -> Vec<u64> {
        self.timings.lock().get(key).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl crate::metrics::MetricsPublisher for MockMetricsPublisher {
    async fn incr(&self, key: &str) {
        self.count(key, 1).await;
    }

    async fn count(&self, key: &str, value: u64) {
        let mut counters = self.counters.lock();
        *counters.entry(key.to_string()).or_insert(0) += value;
    }

    async fn incr_with_tags(&self, key: &str, _tags: &[(&str, &str)]) {
        self.incr(key).await;
    }

    async fn gauge(&self, key: &str, value: u64) {
        self.gauges.lock().insert(key.to_string(), value);
    }

    async fn gauge_with_tags(&self, key: &str, value: u64, _tags: &[(&str, &str)]) {
        self.gauge(key, value).await;
    }

    async fn time(&self, key: &str, millis: u64) {
        self.timings
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(millis);
    }

    async fn time_with_tags(&self, key: &str, millis: u64, _tags: &[(&str, &str)]) {
        self.time(key, millis).await;
    }
}
