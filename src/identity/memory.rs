use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Identity, IdentityDirectory};
use crate::errors::IdentityError;

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    /// Lifetime of "no such account" answers. Kept short so new accounts
    /// become visible quickly.
    pub negative_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_500_000,
            ttl: Duration::hours(24),
            negative_ttl: Duration::minutes(2),
        }
    }
}

#[derive(Clone)]
struct CachedEntry<T> {
    value: Option<T>,
    cached_at: DateTime<Utc>,
}

impl<T> CachedEntry<T> {
    fn is_expired(&self, config: &CacheConfig) -> bool {
        let ttl = if self.value.is_some() {
            config.ttl
        } else {
            config.negative_ttl
        };
        Utc::now() - self.cached_at > ttl
    }
}

/// In-process LRU in front of another directory.
///
/// Lookup failures are not cached; only definite answers are.
pub struct MemoryDirectory {
    inner: Arc<dyn IdentityDirectory>,
    identities: RwLock<LruCache<String, CachedEntry<Identity>>>,
    handles: RwLock<LruCache<String, CachedEntry<String>>>,
    config: CacheConfig,
}

impl MemoryDirectory {
    pub fn new(inner: Arc<dyn IdentityDirectory>, config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            identities: RwLock::new(LruCache::new(capacity)),
            handles: RwLock::new(LruCache::new(capacity)),
            config,
        }
    }

    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl IdentityDirectory for MemoryDirectory {
    async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError> {
        {
            let mut cache = self.identities.write().await;
            if let Some(cached) = cache.get(did) {
                if !cached.is_expired(&self.config) {
                    return Ok(cached.value.clone());
                }
                cache.pop(did);
            }
        }

        let resolved = self.inner.lookup_did(did).await?;
        self.identities.write().await.put(
            did.to_string(),
            CachedEntry {
                value: resolved.clone(),
                cached_at: Utc::now(),
            },
        );
        Ok(resolved)
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, IdentityError> {
        let handle = handle.to_lowercase();
        {
            let mut cache = self.handles.write().await;
            if let Some(cached) = cache.get(&handle) {
                if !cached.is_expired(&self.config) {
                    return Ok(cached.value.clone());
                }
                cache.pop(&handle);
            }
        }

        let resolved = self.inner.resolve_handle(&handle).await?;
        self.handles.write().await.put(
            handle,
            CachedEntry {
                value: resolved.clone(),
                cached_at: Utc::now(),
            },
        );
        Ok(resolved)
    }

    async fn purge(&self, did: &str) -> Result<(), IdentityError> {
        let removed = self.identities.write().await.pop(did);
        if let Some(handle) = removed.and_then(|entry| entry.value).and_then(|id| id.handle) {
            self.handles.write().await.pop(&handle);
        }
        debug!(did = %did, "Purged cached identity");
        self.inner.purge(did).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::test_identity;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDirectory {
        lookups: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IdentityDirectory for CountingDirectory {
        async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IdentityError::DocumentFetchFailed {
                    did: did.to_string(),
                    details: "unavailable".to_string(),
                });
            }
            if did == "did:plc:ghost" {
                return Ok(None);
            }
            Ok(Some(test_identity(did, "alice.test")))
        }

        async fn resolve_handle(&self, _handle: &str) -> Result<Option<String>, IdentityError> {
            Ok(Some("did:plc:alice".to_string()))
        }

        async fn purge(&self, _did: &str) -> Result<(), IdentityError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hits_are_served_from_cache() {
        let inner = Arc::new(CountingDirectory::default());
        let directory = MemoryDirectory::new(inner.clone(), CacheConfig::default());

        directory.lookup_did("did:plc:alice").await.unwrap();
        directory.lookup_did("did:plc:alice").await.unwrap();
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 1);

        directory.purge("did:plc:alice").await.unwrap();
        directory.lookup_did("did:plc:alice").await.unwrap();
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_negative_answers_expire() {
        let inner = Arc::new(CountingDirectory::default());
        let config = CacheConfig {
            negative_ttl: Duration::zero(),
            ..CacheConfig::default()
        };
        let directory = MemoryDirectory::new(inner.clone(), config);

        assert!(directory.lookup_did("did:plc:ghost").await.unwrap().is_none());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(directory.lookup_did("did:plc:ghost").await.unwrap().is_none());
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let inner = Arc::new(CountingDirectory {
            fail: true,
            ..Default::default()
        });
        let directory = MemoryDirectory::new(inner.clone(), CacheConfig::default());

        assert!(directory.lookup_did("did:plc:alice").await.is_err());
        assert!(directory.lookup_did("did:plc:alice").await.is_err());
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 2);
        assert!(directory.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let inner = Arc::new(CountingDirectory::default());
        let config = CacheConfig {
            capacity: 2,
            ..CacheConfig::default()
        };
        let directory = MemoryDirectory::new(inner.clone(), config);

        directory.lookup_did("did:plc:a").await.unwrap();
        directory.lookup_did("did:plc:b").await.unwrap();
        directory.lookup_did("did:plc:c").await.unwrap();
        assert_eq!(directory.len().await, 2);

        directory.lookup_did("did:plc:a").await.unwrap();
        assert_eq!(inner.lookups.load(Ordering::SeqCst), 4);
    }
}
