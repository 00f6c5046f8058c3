//! Durable stream cursors.
//!
//! A [`StreamCursor`] tracks, in memory, which sequences have been handed to
//! workers and which are still in flight. Only the highest sequence below every
//! in-flight event is ever written to the [`CursorStore`], so a restart replays
//! the in-flight tail and nothing older.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Pool, redis::AsyncCommands};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::CursorError;
use crate::metrics::SharedMetricsPublisher;

pub const FIREHOSE_CURSOR_KEY: &str = "automod/firehose/cursor";
pub const OZONE_CURSOR_KEY: &str = "automod/ozone/cursor";

/// Identifies one logical stream and the key its cursor is stored under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamId {
    Firehose,
    Ozone,
}

impl StreamId {
    pub fn key(&self) -> &'static str {
        match self {
            StreamId::Firehose => FIREHOSE_CURSOR_KEY,
            StreamId::Ozone => OZONE_CURSOR_KEY,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamId::Firehose => "firehose",
            StreamId::Ozone => "ozone",
        }
    }
}

/// Get/set-by-key storage for cursor values.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CursorError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), CursorError>;
}

#[derive(Default)]
pub struct MemoryCursorStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CursorError> {
        Ok(self.values.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CursorError> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Keeps cursors in memory and snapshots every key to a JSON file on write.
///
/// The snapshot is written to a sibling temp file and renamed into place.
pub struct FileCursorStore {
    path: PathBuf,
    values: tokio::sync::Mutex<BTreeMap<String, String>>,
}

impl FileCursorStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CursorError> {
        let path = path.into();
        let values = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<BTreeMap<String, String>>(&bytes).map_err(
                |e| CursorError::ReadFailed {
                    key: path.display().to_string(),
                    details: e.to_string(),
                },
            )?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(CursorError::ReadFailed {
                    key: path.display().to_string(),
                    details: e.to_string(),
                });
            }
        };

        Ok(Self {
            path,
            values: tokio::sync::Mutex::new(values),
        })
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CursorError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CursorError> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value.to_string());

        let write_failed = |details: String| CursorError::WriteFailed {
            key: key.to_string(),
            details,
        };
        let bytes = serde_json::to_vec_pretty(&*values).map_err(|e| write_failed(e.to_string()))?;
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| write_failed(e.to_string()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| write_failed(e.to_string()))?;
        Ok(())
    }
}

pub struct RedisCursorStore {
    pool: Pool,
}

impl RedisCursorStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CursorError> {
        let read_failed = |details: String| CursorError::ReadFailed {
            key: key.to_string(),
            details,
        };
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| read_failed(e.to_string()))?;
        conn.get::<_, Option<String>>(key)
            .await
            .map_err(|e| read_failed(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CursorError> {
        let write_failed = |details: String| CursorError::WriteFailed {
            key: key.to_string(),
            details,
        };
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| write_failed(e.to_string()))?;
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| write_failed(e.to_string()))
    }
}

/// In-flight bookkeeping for one sequence-numbered stream.
pub struct StreamCursor {
    stream: StreamId,
    store: Arc<dyn CursorStore>,
    metrics: SharedMetricsPublisher,
    claimed: AtomicI64,
    persisted: AtomicI64,
    in_flight: Mutex<BTreeMap<i64, usize>>,
    persisted_at: Mutex<Option<DateTime<Utc>>>,
}

impl StreamCursor {
    pub fn new(
        stream: StreamId,
        store: Arc<dyn CursorStore>,
        metrics: SharedMetricsPublisher,
    ) -> Self {
        Self {
            stream,
            store,
            metrics,
            claimed: AtomicI64::new(0),
            persisted: AtomicI64::new(0),
            in_flight: Mutex::new(BTreeMap::new()),
            persisted_at: Mutex::new(None),
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Read the persisted sequence and seed the in-memory marks from it.
    pub async fn load(&self) -> Result<Option<i64>, CursorError> {
        let key = self.stream.key();
        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };
        let seq = value
            .trim()
            .parse::<i64>()
            .map_err(|_| CursorError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
            })?;

        self.claimed.fetch_max(seq, Ordering::SeqCst);
        self.persisted.fetch_max(seq, Ordering::SeqCst);
        info!(stream = self.stream.as_str(), seq, "Loaded persisted cursor");
        Ok(Some(seq))
    }

    /// Record that `seq` has been handed to a worker queue.
    pub fn claim(&self, seq: i64) {
        *self.in_flight.lock().entry(seq).or_insert(0) += 1;
        self.advance(seq);
    }

    /// Move the claimed high-water mark without tracking work, for frames that
    /// need no processing.
    pub fn advance(&self, seq: i64) {
        self.claimed.fetch_max(seq, Ordering::SeqCst);
    }

    /// Record that the event with `seq` finished processing (or was abandoned).
    pub fn complete(&self, seq: i64) {
        let mut in_flight = self.in_flight.lock();
        if let Some(count) = in_flight.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&seq);
            }
        }
    }

    pub fn last_claimed(&self) -> i64 {
        self.claimed.load(Ordering::SeqCst)
    }

    pub fn last_persisted(&self) -> i64 {
        self.persisted.load(Ordering::SeqCst)
    }

    pub fn persisted_at(&self) -> Option<DateTime<Utc>> {
        *self.persisted_at.lock()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().values().sum()
    }

    /// Highest sequence such that it and everything before it has completed.
    pub fn safe_sequence(&self) -> i64 {
        let claimed = self.claimed.load(Ordering::SeqCst);
        match self.in_flight.lock().keys().next() {
            Some(lowest) => (lowest - 1).min(claimed),
            None => claimed,
        }
    }

    /// Durably write the safe sequence if it moved forward.
    pub async fn persist(&self) -> Result<Option<i64>, CursorError> {
        let safe = self.safe_sequence();
        if safe <= self.persisted.load(Ordering::SeqCst) {
            return Ok(None);
        }

        self.store.set(self.stream.key(), &safe.to_string()).await?;
        self.persisted.fetch_max(safe, Ordering::SeqCst);
        *self.persisted_at.lock() = Some(Utc::now());

        self.metrics
            .gauge_with_tags(
                "cursor.persisted",
                safe.max(0) as u64,
                &[("stream", self.stream.as_str())],
            )
            .await;
        debug!(stream = self.stream.as_str(), seq = safe, "Persisted cursor");
        Ok(Some(safe))
    }
}

/// Persist `cursor` every `interval` until cancelled.
///
/// The final persist at shutdown is left to the caller so that it can happen
/// after the worker pool has drained.
pub async fn run_persist_loop(
    cursor: Arc<StreamCursor>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(stream = cursor.stream().as_str(), "Cursor persist loop stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(err) = cursor.persist().await {
                    warn!(stream = cursor.stream().as_str(), error = ?err, "Failed to persist cursor");
                }
            }
        }
    }
}

/// A timestamp cursor for the moderation-event stream.
///
/// Values are stored as RFC 3339 strings. They are parsed and compared as
/// UTC instants, so differing offsets or precision order correctly, and the
/// cursor only ever moves forward.
pub struct TimestampCursor {
    store: Arc<dyn CursorStore>,
    current: Mutex<Option<DateTime<Utc>>>,
    persisted: Mutex<Option<DateTime<Utc>>>,
}

impl TimestampCursor {
    pub fn new(store: Arc<dyn CursorStore>) -> Self {
        Self {
            store,
            current: Mutex::new(None),
            persisted: Mutex::new(None),
        }
    }

    pub async fn load(&self) -> Result<Option<DateTime<Utc>>, CursorError> {
        let key = StreamId::Ozone.key();
        let Some(value) = self.store.get(key).await? else {
            return Ok(None);
        };
        let at = DateTime::parse_from_rfc3339(value.trim())
            .map_err(|_| CursorError::InvalidValue {
                key: key.to_string(),
                value: value.clone(),
            })?
            .with_timezone(&Utc);
        *self.current.lock() = Some(at);
        *self.persisted.lock() = Some(at);
        Ok(Some(at))
    }

    pub fn advance(&self, at: DateTime<Utc>) {
        let mut current = self.current.lock();
        if current.is_none_or(|existing| at > existing) {
            *current = Some(at);
        }
    }

    pub fn current(&self) -> Option<DateTime<Utc>> {
        *self.current.lock()
    }

    pub async fn persist(&self) -> Result<Option<DateTime<Utc>>, CursorError> {
        let current = *self.current.lock();
        let Some(at) = current else {
            return Ok(None);
        };
        if self.persisted.lock().is_some_and(|persisted| persisted >= at) {
            return Ok(None);
        }
        self.store
            .set(
                StreamId::Ozone.key(),
                &at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            )
            .await?;
        *self.persisted.lock() = Some(at);
        Ok(Some(at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoOpMetricsPublisher;

    fn cursor(store: Arc<dyn CursorStore>) -> StreamCursor {
        StreamCursor::new(StreamId::Firehose, store, Arc::new(NoOpMetricsPublisher))
    }

    #[tokio::test]
    async fn test_safe_sequence_stops_below_in_flight_work() {
        let cursor = cursor(Arc::new(MemoryCursorStore::new()));

        for seq in 1..=5 {
            cursor.claim(seq);
        }
        cursor.complete(1);
        cursor.complete(2);
        cursor.complete(4);

        assert_eq!(cursor.last_claimed(), 5);
        assert_eq!(cursor.safe_sequence(), 2);

        cursor.complete(3);
        assert_eq!(cursor.safe_sequence(), 4);

        cursor.complete(5);
        assert_eq!(cursor.safe_sequence(), 5);
    }

    #[tokio::test]
    async fn test_advance_without_work_moves_safe_sequence() {
        let cursor = cursor(Arc::new(MemoryCursorStore::new()));

        cursor.claim(10);
        cursor.advance(11);
        assert_eq!(cursor.safe_sequence(), 9);

        cursor.complete(10);
        assert_eq!(cursor.safe_sequence(), 11);
    }

    #[tokio::test]
    async fn test_persist_is_monotonic() {
        let store: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());
        let cursor = cursor(store.clone());

        cursor.claim(7);
        cursor.complete(7);
        assert_eq!(cursor.persist().await.unwrap(), Some(7));
        assert_eq!(cursor.persist().await.unwrap(), None);
        assert_eq!(
            store.get(FIREHOSE_CURSOR_KEY).await.unwrap(),
            Some("7".to_string())
        );

        // A lower sequence in flight never drags the stored value backwards.
        cursor.claim(3);
        assert_eq!(cursor.persist().await.unwrap(), None);
        assert_eq!(cursor.last_persisted(), 7);
    }

    #[tokio::test]
    async fn test_restart_resumes_before_in_flight_tail() {
        let store: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());

        let first = cursor(store.clone());
        for seq in 1..=5 {
            first.claim(seq);
        }
        first.complete(1);
        first.complete(2);
        first.complete(4);
        first.persist().await.unwrap();

        let second = cursor(store);
        let resumed = second.load().await.unwrap();
        assert_eq!(resumed, Some(2));
        assert!(resumed.unwrap() <= first.last_claimed());
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let store: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());
        store.set(FIREHOSE_CURSOR_KEY, "not-a-number").await.unwrap();

        let cursor = cursor(store);
        assert!(matches!(
            cursor.load().await,
            Err(CursorError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursors.json");

        {
            let store = FileCursorStore::open(&path).await.unwrap();
            store.set(FIREHOSE_CURSOR_KEY, "42").await.unwrap();
            store.set(OZONE_CURSOR_KEY, "2024-01-01T00:00:00Z").await.unwrap();
        }

        let store = FileCursorStore::open(&path).await.unwrap();
        assert_eq!(
            store.get(FIREHOSE_CURSOR_KEY).await.unwrap(),
            Some("42".to_string())
        );
        assert_eq!(
            store.get(OZONE_CURSOR_KEY).await.unwrap(),
            Some("2024-01-01T00:00:00Z".to_string())
        );
    }

    #[tokio::test]
    async fn test_timestamp_cursor_only_moves_forward() {
        let store: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());
        let cursor = TimestampCursor::new(store.clone());

        let later = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let earlier = DateTime::parse_from_rfc3339("2024-05-01T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        cursor.advance(later);
        cursor.advance(earlier);
        assert_eq!(cursor.current(), Some(later));

        assert_eq!(cursor.persist().await.unwrap(), Some(later));
        assert_eq!(cursor.persist().await.unwrap(), None);

        let reloaded = TimestampCursor::new(store);
        assert_eq!(reloaded.load().await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn test_timestamp_cursor_orders_by_instant_not_text() {
        let store: Arc<dyn CursorStore> = Arc::new(MemoryCursorStore::new());
        store
            .set(OZONE_CURSOR_KEY, "2024-05-01T13:00:00+02:00")
            .await
            .unwrap();
        let cursor = TimestampCursor::new(store.clone());
        let loaded = cursor.load().await.unwrap().unwrap();
        assert_eq!(loaded.to_rfc3339(), "2024-05-01T11:00:00+00:00");

        // Sorts before the stored text but is an hour later.
        let later = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        cursor.advance(later);
        assert_eq!(cursor.current(), Some(later));
        assert_eq!(cursor.persist().await.unwrap(), Some(later));
        assert_eq!(
            store.get(OZONE_CURSOR_KEY).await.unwrap(),
            Some("2024-05-01T12:00:00.000000Z".to_string())
        );
    }
}
