//! One-shot record fetching for the debugging commands.
//!
//! Records are read straight from the account's PDS and either pushed
//! through the rule pipeline as synthetic commits or dumped as a capture.

use atproto_client::{
    client::Auth,
    com::atproto::repo::{GetRecordResponse, get_record},
};
use atproto_record::aturi::ATURI;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::dispatch::DispatchReport;
use crate::errors::CaptureError;
use crate::event::{FirehoseEvent, OpAction, RecordOp};
use crate::identity::{Identity, IdentityDirectory, lookup_identifier};
use crate::processor::RulePipeline;

pub const POST_COLLECTION: &str = "app.bsky.feed.post";

/// Parse an `at://` URI that names a single record.
pub fn parse_record_uri(value: &str) -> Result<ATURI, CaptureError> {
    let invalid = || CaptureError::InvalidAtUri {
        uri: value.to_string(),
    };
    let parsed = ATURI::from_str(value).map_err(|_| invalid())?;
    if parsed.collection.is_empty() || parsed.record_key.is_empty() {
        return Err(invalid());
    }
    Ok(parsed)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedRecord {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    #[serde(default)]
    records: Vec<CapturedRecord>,
}

#[derive(Debug, Serialize)]
pub struct AccountCapture {
    pub identity: Identity,
    pub captured_at: DateTime<Utc>,
    pub posts: Vec<CapturedRecord>,
}

pub struct RecordFetcher {
    http: reqwest::Client,
    identities: Arc<dyn IdentityDirectory>,
}

impl RecordFetcher {
    pub fn new(http: reqwest::Client, identities: Arc<dyn IdentityDirectory>) -> Self {
        Self { http, identities }
    }

    pub async fn resolve(&self, identifier: &str) -> Result<Identity, CaptureError> {
        lookup_identifier(self.identities.as_ref(), identifier)
            .await
            .map_err(|e| CaptureError::FetchFailed {
                details: e.to_string(),
            })?
            .ok_or_else(|| CaptureError::AccountNotFound {
                identifier: identifier.to_string(),
            })
    }

    fn pds(identity: &Identity) -> Result<&str, CaptureError> {
        identity
            .pds_endpoint
            .as_deref()
            .ok_or_else(|| CaptureError::MissingPds {
                did: identity.did.clone(),
            })
    }

    /// Fetch one record with `com.atproto.repo.getRecord`.
    pub async fn get_record(&self, uri: &ATURI) -> Result<(Identity, CapturedRecord), CaptureError> {
        let identity = self.resolve(&uri.authority).await?;
        let pds = Self::pds(&identity)?;
        debug!(pds = %pds, collection = %uri.collection, rkey = %uri.record_key, "Fetching record");

        let response = get_record(
            &self.http,
            &Auth::None,
            pds,
            &identity.did,
            &uri.collection,
            &uri.record_key,
            None,
        )
        .await
        .map_err(|e| CaptureError::FetchFailed {
            details: e.to_string(),
        })?;

        let record = match response {
            GetRecordResponse::Record {
                uri, cid, value, ..
            } => serde_json::from_value(json!({
                "uri": uri,
                "cid": cid,
                "value": value
            }))
            .map_err(|e| CaptureError::FetchFailed {
                details: e.to_string(),
            })?,
            GetRecordResponse::Error(e) => {
                return Err(CaptureError::FetchFailed {
                    details: e.error_message(),
                });
            }
        };
        Ok((identity, record))
    }

    /// Most recent posts, newest first, with `com.atproto.repo.listRecords`.
    pub async fn list_recent_posts(
        &self,
        identifier: &str,
        limit: u32,
    ) -> Result<(Identity, Vec<CapturedRecord>), CaptureError> {
        let identity = self.resolve(identifier).await?;
        let fetch_failed = |details: String| CaptureError::FetchFailed { details };

        let mut url = url::Url::parse(&format!(
            "{}/xrpc/com.atproto.repo.listRecords",
            Self::pds(&identity)?
        ))
        .map_err(|e| fetch_failed(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("repo", &identity.did)
            .append_pair("collection", POST_COLLECTION)
            .append_pair("limit", &limit.clamp(1, 100).to_string());

        let body = atproto_client::client::get_json(&self.http, url.as_str())
            .await
            .map_err(|e| fetch_failed(e.to_string()))?;
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(fetch_failed(error.to_string()));
        }
        let page: ListRecordsResponse =
            serde_json::from_value(body).map_err(|e| fetch_failed(e.to_string()))?;
        Ok((identity, page.records))
    }

    pub async fn capture_recent(
        &self,
        identifier: &str,
        limit: u32,
    ) -> Result<AccountCapture, CaptureError> {
        let (identity, posts) = self.list_recent_posts(identifier, limit).await?;
        Ok(AccountCapture {
            identity,
            captured_at: Utc::now(),
            posts,
        })
    }
}

/// Wrap a fetched record as a single-op create commit. Sequence 0 marks it as
/// not coming from the relay.
pub fn record_event(did: &str, record: &CapturedRecord) -> Result<FirehoseEvent, CaptureError> {
    let uri = parse_record_uri(&record.uri)?;
    Ok(FirehoseEvent::commit(
        0,
        did,
        vec![RecordOp {
            action: OpAction::Create,
            collection: uri.collection,
            rkey: uri.record_key,
            cid: record.cid.clone(),
            value: Some(record.value.clone()),
        }],
    ))
}

pub async fn process_record(
    fetcher: &RecordFetcher,
    pipeline: &RulePipeline,
    uri: &str,
) -> Result<DispatchReport, CaptureError> {
    let uri = parse_record_uri(uri)?;
    let (identity, record) = fetcher.get_record(&uri).await?;
    debug!(uri = %record.uri, cid = ?record.cid, "Fetched record");
    let event = record_event(&identity.did, &record)?;
    Ok(pipeline.handle(&event).await)
}

pub async fn process_recent(
    fetcher: &RecordFetcher,
    pipeline: &RulePipeline,
    identifier: &str,
    limit: u32,
) -> Result<DispatchReport, CaptureError> {
    let (identity, records) = fetcher.list_recent_posts(identifier, limit).await?;
    info!(did = %identity.did, records = records.len(), "Processing recent posts");

    let mut report = DispatchReport::default();
    // Oldest first, as they would have arrived on the firehose.
    for record in records.iter().rev() {
        let event = record_event(&identity.did, record)?;
        report.merge(&pipeline.handle(&event).await);
    }
    Ok(report)
}
