//! Decoded firehose events handed from the consumer to the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of repository event carried by a firehose frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Identity,
    Account,
    Tombstone,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Commit => "commit",
            EventKind::Identity => "identity",
            EventKind::Account => "account",
            EventKind::Tombstone => "tombstone",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OpAction::Create),
            "update" => Some(OpAction::Update),
            "delete" => Some(OpAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

/// A single record mutation inside a commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordOp {
    pub action: OpAction,
    pub collection: String,
    pub rkey: String,
    pub cid: Option<String>,
    /// Decoded record body, absent for deletes or when the block was not shipped.
    pub value: Option<serde_json::Value>,
}

impl RecordOp {
    pub fn at_uri(&self, did: &str) -> String {
        format!("at://{}/{}/{}", did, self.collection, self.rkey)
    }
}

/// Identity-change details from an `#identity` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdentityChange {
    pub handle: Option<String>,
}

/// Hosting-status details from an `#account` frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AccountChange {
    pub active: bool,
    pub status: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FirehoseEvent {
    pub sequence: i64,
    pub did: String,
    pub kind: EventKind,
    pub rev: Option<String>,
    pub ops: Vec<RecordOp>,
    pub identity: Option<IdentityChange>,
    pub account: Option<AccountChange>,
    /// Relay-side broadcast time as reported in the frame.
    pub time: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl FirehoseEvent {
    pub fn commit(sequence: i64, did: impl Into<String>, ops: Vec<RecordOp>) -> Self {
        Self::new(sequence, did, EventKind::Commit, ops)
    }

    pub fn new(
        sequence: i64,
        did: impl Into<String>,
        kind: EventKind,
        ops: Vec<RecordOp>,
    ) -> Self {
        Self {
            sequence,
            did: did.into(),
            kind,
            rev: None,
            ops,
            identity: None,
            account: None,
            time: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_identity(mut self, identity: IdentityChange) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_account(mut self, account: AccountChange) -> Self {
        self.account = Some(account);
        self
    }
}

/// Split a commit op path of the form `collection/rkey`.
pub fn parse_record_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.splitn(2, '/');
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    Some((collection, rkey))
}
