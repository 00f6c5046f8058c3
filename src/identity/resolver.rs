use async_trait::async_trait;
use atproto_identity::{model::Document, resolve::IdentityResolver};
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::StatusCode;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

use super::{Identity, IdentityDirectory, is_valid_did};
use crate::errors::IdentityError;

impl From<Document> for Identity {
    fn from(document: Document) -> Self {
        let handle = document
            .also_known_as
            .iter()
            .find_map(|aka| aka.strip_prefix("at://"))
            .map(|handle| handle.to_lowercase());

        let pds_endpoint = document
            .pds_endpoints()
            .first()
            .map(|endpoint| endpoint.trim_end_matches('/').to_string());

        let verification_keys = verification_keys(&document);

        Identity {
            did: document.id.to_string(),
            handle,
            pds_endpoint,
            also_known_as: document.also_known_as.clone(),
            verification_keys,
            resolved_at: Utc::now(),
        }
    }
}

/// Multibase public keys from the document's verification methods.
fn verification_keys(document: &Document) -> Vec<String> {
    let Ok(value) = serde_json::to_value(document) else {
        return Vec::new();
    };
    value
        .get("verificationMethod")
        .and_then(|methods| methods.as_array())
        .map(|methods| {
            methods
                .iter()
                .filter_map(|method| method.get("publicKeyMultibase")?.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// A registry answer of 404 or 410 means the DID does not exist.
fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .filter_map(|e| e.status())
        .any(|status| status == StatusCode::NOT_FOUND || status == StatusCode::GONE)
}

/// Uncached directory over an ATProto identity resolver.
///
/// DIDs resolve through the PLC registry or did:web documents; handles
/// resolve through DNS TXT records and `/.well-known/atproto-did`, falling
/// back to the appview's `resolveHandle`. Every call that can reach the
/// registry shares one rate limiter.
pub struct ResolverDirectory {
    resolver: Arc<dyn IdentityResolver + Send + Sync>,
    http: reqwest::Client,
    appview_host: String,
    plc_limiter: Arc<DefaultDirectRateLimiter>,
}

impl ResolverDirectory {
    pub fn new(
        resolver: Arc<dyn IdentityResolver + Send + Sync>,
        http: reqwest::Client,
        appview_host: &str,
        plc_requests_per_second: u32,
    ) -> Self {
        let quota = Quota::per_second(
            NonZeroU32::new(plc_requests_per_second).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            resolver,
            http,
            appview_host: appview_host.trim_end_matches('/').to_string(),
            plc_limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    async fn resolve_with_appview(&self, handle: &str) -> Result<Option<String>, IdentityError> {
        let resolution_failed = |details: String| IdentityError::HandleResolutionFailed {
            handle: handle.to_string(),
            details,
        };
        let mut url = url::Url::parse(&format!(
            "{}/xrpc/com.atproto.identity.resolveHandle",
            self.appview_host
        ))
        .map_err(|e| resolution_failed(e.to_string()))?;
        url.query_pairs_mut().append_pair("handle", handle);

        let response = atproto_client::client::get_json(&self.http, url.as_str())
            .await
            .map_err(|e| resolution_failed(e.to_string()))?;

        // Unknown handles come back as an XRPC error body without a `did`.
        Ok(response
            .get("did")
            .and_then(|did| did.as_str())
            .filter(|did| is_valid_did(did))
            .map(str::to_string))
    }
}

#[async_trait]
impl IdentityDirectory for ResolverDirectory {
    async fn lookup_did(&self, did: &str) -> Result<Option<Identity>, IdentityError> {
        if !is_valid_did(did) {
            return Err(IdentityError::InvalidDid {
                did: did.to_string(),
            });
        }

        if did.starts_with("did:plc:") {
            self.plc_limiter.until_ready().await;
        }

        let document = match self.resolver.resolve(did).await {
            Ok(document) => document,
            Err(e) if is_not_found(&e) => {
                debug!(did = %did, "DID not found in registry");
                return Ok(None);
            }
            Err(e) => {
                return Err(IdentityError::DocumentFetchFailed {
                    did: did.to_string(),
                    details: e.to_string(),
                });
            }
        };

        if document.id != did {
            return Err(IdentityError::DocumentMalformed {
                did: did.to_string(),
                details: format!("document id {} does not match", document.id),
            });
        }

        Ok(Some(document.into()))
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>, IdentityError> {
        self.plc_limiter.until_ready().await;
        match self.resolver.resolve(handle).await {
            Ok(document) => Ok(Some(document.id.to_string())),
            Err(e) => {
                debug!(handle = %handle, error = %e, "Handle did not resolve directly, asking the appview");
                self.resolve_with_appview(handle).await
            }
        }
    }

    async fn purge(&self, _did: &str) -> Result<(), IdentityError> {
        Ok(())
    }
}
