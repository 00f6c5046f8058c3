//! Identity resolution for accounts seen on the firehose.
//!
//! The pipeline depends only on [`IdentityDirectory`]. [`resolver::ResolverDirectory`]
//! adapts an `atproto_identity` resolver; [`memory::MemoryDirectory`] and
//! [`redis::RedisDirectory`] wrap it with a local LRU or a shared Redis cache.

pub mod memory;
pub mod redis;
pub mod resolver;

use async_trait::async_trait;
use atproto_identity::resolve::{InputType, parse_input};
use atproto_identity::validation::{is_valid_did_method_plc, is_valid_did_method_web};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::IdentityError;

pub use memory::MemoryDirectory;
pub use redis::RedisDirectory;
pub use resolver::ResolverDirectory;

/// Resolved account metadata. Read-only to the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub did: String,
    pub handle: Option<String>,
    pub pds_endpoint: Option<String>,
    #[serde(default)]
    pub also_known_as: Vec<String>,
    #[serde(default)]
    pub verification_keys: Vec<String>,
    pub resolved_at: DateTime<Utc>,
}

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Resolve a DID. `Ok(None)` means the registry has no such account.
    async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError>;

    /// Resolve a handle to its DID. `Ok(None)` means the handle does not resolve.
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, IdentityError>;

    /// Drop any cached state for `did`, typically after an `#identity` event.
    async fn purge(&self, did: &str) -> Result<(), IdentityError>;
}

pub fn is_valid_did(did: &str) -> bool {
    is_valid_did_method_plc(did) || is_valid_did_method_web(did, false)
}

/// Resolve either a DID or a handle to an identity.
pub async fn lookup_identifier(
    directory: &dyn IdentityDirectory,
    identifier: &str,
) -> Result<Option<Identity>, IdentityError> {
    let identifier = identifier.trim().trim_start_matches('@');
    let input = parse_input(identifier).map_err(|e| IdentityError::InvalidIdentifier {
        identifier: identifier.to_string(),
        details: e.to_string(),
    })?;
    match input {
        InputType::Handle(handle) => match directory.resolve_handle(&handle.to_lowercase()).await? {
            Some(did) => directory.lookup_did(&did).await,
            None => Ok(None),
        },
        _ => directory.lookup_did(identifier).await,
    }
}
