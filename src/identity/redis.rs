use async_trait::async_trait;
use deadpool_redis::{Pool, redis::AsyncCommands};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Identity, IdentityDirectory};
use crate::errors::IdentityError;

const NEGATIVE_MARKER: &str = "null";

/// Redis-backed cache shared by every instance of the daemon.
///
/// Entries are JSON; a missing account is stored as `null` with a short TTL.
pub struct RedisDirectory {
    inner: Arc<dyn IdentityDirectory>,
    pool: Pool,
    key_prefix: String,
    ttl: Duration,
    negative_ttl: Duration,
}

impl RedisDirectory {
    pub fn new(
        inner: Arc<dyn IdentityDirectory>,
        pool: Pool,
        ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self::with_prefix(inner, pool, "automod/identity/", ttl, negative_ttl)
    }

    pub fn with_prefix(
        inner: Arc<dyn IdentityDirectory>,
        pool: Pool,
        key_prefix: &str,
        ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            inner,
            pool,
            key_prefix: key_prefix.to_string(),
            ttl,
            negative_ttl,
        }
    }

    fn did_key(&self, did: &str) -> String {
        format!("{}did/{}", self.key_prefix, did)
    }

    fn handle_key(&self, handle: &str) -> String {
        format!("{}handle/{}", self.key_prefix, handle)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, IdentityError> {
        self.pool
            .get()
            .await
            .map_err(|e| IdentityError::CacheFailed {
                details: e.to_string(),
            })
    }

    async fn read<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<Option<T>> {
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = ?e, "Identity cache unavailable");
                return None;
            }
        };
        let data: Option<String> = match conn.get(key).await {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = ?e, "Identity cache read failed");
                return None;
            }
        };
        let data = data?;
        if data == NEGATIVE_MARKER {
            return Some(None);
        }
        match serde_json::from_str::<T>(&data) {
            Ok(value) => Some(Some(value)),
            Err(e) => {
                warn!(key = %key, error = ?e, "Failed to deserialize cached identity");
                let _: Result<(), _> = conn.del(key).await;
                None
            }
        }
    }

    async fn write<T: serde::Serialize>(&self, key: &str, value: Option<&T>) {
        let (data, ttl) = match value {
            Some(value) => match serde_json::to_string(value) {
                Ok(data) => (data, self.ttl),
                Err(e) => {
                    warn!(key = %key, error = ?e, "Failed to serialize identity");
                    return;
                }
            },
            None => (NEGATIVE_MARKER.to_string(), self.negative_ttl),
        };
        let mut conn = match self.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = ?e, "Identity cache unavailable");
                return;
            }
        };
        let result: Result<(), _> = conn.set_ex(key, data, ttl.as_secs().max(1)).await;
        if let Err(e) = result {
            warn!(key = %key, error = ?e, "Identity cache write failed");
        }
    }
}

#[async_trait]
impl IdentityDirectory for RedisDirectory {
    async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError> {
        let key = self.did_key(did);
        if let Some(cached) = self.read::<Identity>(&key).await {
            debug!(did = %did, "Identity cache hit");
            return Ok(cached);
        }

        let resolved = self.inner.lookup_did(did).await?;
        self.write(&key, resolved.as_ref()).await;
        Ok(resolved)
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, IdentityError> {
        let handle = handle.to_lowercase();
        let key = self.handle_key(&handle);
        if let Some(cached) = self.read::<String>(&key).await {
            return Ok(cached);
        }

        let resolved = self.inner.resolve_handle(&handle).await?;
        self.write(&key, resolved.as_ref()).await;
        Ok(resolved)
    }

    async fn purge(&self, did: &str) -> Result<(), IdentityError> {
        let key = self.did_key(did);
        let cached = self.read::<Identity>(&key).await.flatten();

        let mut conn = self.connection().await?;
        let _: u64 = conn
            .del(&key)
            .await
            .map_err(|e| IdentityError::CacheFailed {
                details: e.to_string(),
            })?;
        if let Some(handle) = cached.and_then(|identity| identity.handle) {
            let _: Result<u64, _> = conn.del(self.handle_key(&handle)).await;
        }

        self.inner.purge(did).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use deadpool_redis::{Config, Runtime};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory(AtomicUsize);

    #[async_trait]
    impl IdentityDirectory for CountingDirectory {
        async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Identity {
                did: did.to_string(),
                handle: Some("alice.test".to_string()),
                pds_endpoint: Some("https://pds.test".to_string()),
                also_known_as: vec!["at://alice.test".to_string()],
                verification_keys: vec![],
                resolved_at: Utc::now(),
            }))
        }

        async fn resolve_handle(&self, _handle: &str) -> Result<Option<String>, IdentityError> {
            Ok(None)
        }

        async fn purge(&self, _did: &str) -> Result<(), IdentityError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_redis_identity_cache() {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            eprintln!("Skipping Redis test: TEST_REDIS_URL not set");
            return;
        };
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .unwrap();
        let inner = Arc::new(CountingDirectory(AtomicUsize::new(0)));
        let prefix = format!("automod-test/{}/", uuid::Uuid::new_v4());
        let directory = RedisDirectory::with_prefix(
            inner.clone(),
            pool,
            &prefix,
            Duration::from_secs(60),
            Duration::from_secs(5),
        );

        let first = directory.lookup_did("did:plc:alice").await.unwrap().unwrap();
        let second = directory.lookup_did("did:plc:alice").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.0.load(Ordering::SeqCst), 1);

        assert!(directory.resolve_handle("nobody.test").await.unwrap().is_none());

        directory.purge("did:plc:alice").await.unwrap();
        directory.lookup_did("did:plc:alice").await.unwrap();
        assert_eq!(inner.0.load(Ordering::SeqCst), 2);
    }
}
