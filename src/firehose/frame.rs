//! Decoding of `com.atproto.sync.subscribeRepos` frames.
//!
//! Each binary message is two concatenated CBOR values: a header `{op, t}`
//! followed by the payload for that message type.

use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use ipld_core::{cid::Cid, ipld::Ipld};
use iroh_car::CarReader;
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Cursor;
use tracing::{trace, warn};

use crate::errors::FirehoseError;
use crate::event::{
    AccountChange, EventKind, FirehoseEvent, IdentityChange, OpAction, RecordOp,
    parse_record_path,
};

/// Result of decoding one frame.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A repository event that needs rule evaluation.
    Event(FirehoseEvent),
    /// A sequenced frame with nothing to evaluate; the cursor still moves past it.
    Sequenced { seq: i64, message_type: String },
    /// An informational frame from the relay.
    Info {
        name: Option<String>,
        message: Option<String>,
    },
    /// A frame without a sequence that carries nothing actionable.
    Ignored { message_type: Option<String> },
}

#[derive(Debug, Deserialize)]
struct FrameHeader {
    op: i32,
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommitPayload {
    seq: i64,
    repo: String,
    rev: String,
    #[serde(default)]
    #[allow(dead_code)]
    commit: Option<Cid>,
    #[serde(with = "serde_bytes", default)]
    blocks: Option<Vec<u8>>,
    ops: Vec<RepoOpPayload>,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoOpPayload {
    action: String,
    path: String,
    cid: Option<Cid>,
}

#[derive(Debug, Deserialize)]
struct IdentityPayload {
    seq: i64,
    did: String,
    time: Option<String>,
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountPayload {
    seq: i64,
    did: String,
    time: Option<String>,
    #[serde(default)]
    active: bool,
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TombstonePayload {
    seq: i64,
    did: String,
    time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfoPayload {
    name: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: Option<String>,
    message: Option<String>,
}

/// Lenient view used to recover a sequence from a payload that failed to decode.
#[derive(Debug, Deserialize)]
struct SequenceOnly {
    seq: Option<i64>,
}

fn decode_header(data: &[u8]) -> Result<(FrameHeader, usize), FirehoseError> {
    let mut cursor = Cursor::new(data);
    let header: FrameHeader =
        ciborium::from_reader(&mut cursor).map_err(|e| FirehoseError::HeaderDecode {
            details: e.to_string(),
        })?;
    Ok((header, cursor.position() as usize))
}

fn recover_sequence(payload: &[u8]) -> Option<i64> {
    serde_ipld_dagcbor::from_slice::<SequenceOnly>(payload)
        .ok()
        .and_then(|p| p.seq)
}

fn decode_payload<'a, T: Deserialize<'a>>(
    payload: &'a [u8],
    message_type: &str,
) -> Result<T, FirehoseError> {
    serde_ipld_dagcbor::from_slice(payload).map_err(|e| FirehoseError::PayloadDecode {
        seq: recover_sequence(payload),
        message_type: message_type.to_string(),
        details: e.to_string(),
    })
}

/// Decode one binary websocket message.
///
/// Relay error frames surface as [`FirehoseError::ErrorFrame`], which callers
/// treat as a transport failure.
pub async fn decode_frame(data: &[u8]) -> Result<DecodedFrame, FirehoseError> {
    let (header, offset) = decode_header(data)?;
    let payload = &data[offset..];

    if header.op == -1 {
        let error = serde_ipld_dagcbor::from_slice::<ErrorPayload>(payload).ok();
        let (error_type, message) = error
            .map(|e| (e.error, e.message))
            .unwrap_or((None, None));
        return Err(FirehoseError::ErrorFrame {
            error_type: error_type.unwrap_or_else(|| "Unknown".to_string()),
            message: message.unwrap_or_default(),
        });
    }

    if header.op != 1 {
        return Ok(DecodedFrame::Ignored {
            message_type: header.t,
        });
    }

    let Some(message_type) = header.t else {
        return Ok(DecodedFrame::Ignored { message_type: None });
    };

    match message_type.as_str() {
        "#commit" => {
            let commit: CommitPayload = decode_payload(payload, &message_type)?;
            Ok(DecodedFrame::Event(decode_commit(commit).await?))
        }
        "#identity" => {
            let identity: IdentityPayload = decode_payload(payload, &message_type)?;
            let mut event = FirehoseEvent::new(identity.seq, identity.did, EventKind::Identity, vec![])
                .with_identity(IdentityChange {
                    handle: identity.handle,
                });
            event.time = identity.time;
            Ok(DecodedFrame::Event(event))
        }
        "#account" => {
            let account: AccountPayload = decode_payload(payload, &message_type)?;
            let mut event = FirehoseEvent::new(account.seq, account.did, EventKind::Account, vec![])
                .with_account(AccountChange {
                    active: account.active,
                    status: account.status,
                });
            event.time = account.time;
            Ok(DecodedFrame::Event(event))
        }
        "#tombstone" => {
            let tombstone: TombstonePayload = decode_payload(payload, &message_type)?;
            let mut event =
                FirehoseEvent::new(tombstone.seq, tombstone.did, EventKind::Tombstone, vec![]);
            event.time = tombstone.time;
            Ok(DecodedFrame::Event(event))
        }
        "#info" => {
            let info: InfoPayload = decode_payload(payload, &message_type)?;
            Ok(DecodedFrame::Info {
                name: info.name,
                message: info.message,
            })
        }
        _ => match recover_sequence(payload) {
            Some(seq) => {
                trace!(message_type = %message_type, seq, "Sequenced frame without rule work");
                Ok(DecodedFrame::Sequenced { seq, message_type })
            }
            None => Ok(DecodedFrame::Ignored {
                message_type: Some(message_type),
            }),
        },
    }
}

async fn decode_commit(commit: CommitPayload) -> Result<FirehoseEvent, FirehoseError> {
    let blocks = match commit.blocks.as_deref() {
        Some(data) if !data.is_empty() => read_car_blocks(data).await.map_err(|err| {
            FirehoseError::PayloadDecode {
                seq: Some(commit.seq),
                message_type: "#commit".to_string(),
                details: err.to_string(),
            }
        })?,
        _ => HashMap::new(),
    };

    let mut ops = Vec::with_capacity(commit.ops.len());
    for op in commit.ops {
        let Some((collection, rkey)) = parse_record_path(&op.path) else {
            warn!(seq = commit.seq, did = %commit.repo, path = %op.path, "Malformed record path, skipping op");
            continue;
        };
        let Some(action) = OpAction::parse(&op.action) else {
            warn!(seq = commit.seq, did = %commit.repo, action = %op.action, "Unknown op action, skipping op");
            continue;
        };

        let cid = op.cid.map(|cid| cid.to_string());
        let value = match (&action, &cid) {
            (OpAction::Delete, _) | (_, None) => None,
            (_, Some(cid)) => blocks.get(cid).and_then(|bytes| {
                match serde_ipld_dagcbor::from_slice::<Ipld>(bytes) {
                    Ok(ipld) => Some(ipld_to_json(ipld)),
                    Err(e) => {
                        warn!(seq = commit.seq, did = %commit.repo, cid = %cid, error = %e, "Record block did not decode");
                        None
                    }
                }
            }),
        };

        ops.push(RecordOp {
            action,
            collection: collection.to_string(),
            rkey: rkey.to_string(),
            cid,
            value,
        });
    }

    Ok(FirehoseEvent {
        sequence: commit.seq,
        did: commit.repo,
        kind: EventKind::Commit,
        rev: Some(commit.rev),
        ops,
        identity: None,
        account: None,
        time: commit.time,
        received_at: Utc::now(),
    })
}

async fn read_car_blocks(data: &[u8]) -> Result<HashMap<String, Vec<u8>>, FirehoseError> {
    let mut reader = CarReader::new(Cursor::new(data))
        .await
        .map_err(|e| FirehoseError::CarParse {
            details: e.to_string(),
        })?;

    let mut blocks = HashMap::new();
    while let Some((cid, block)) = reader
        .next_block()
        .await
        .map_err(|e| FirehoseError::CarParse {
            details: e.to_string(),
        })?
    {
        blocks.insert(cid.to_string(), block);
    }
    Ok(blocks)
}

/// Convert a DAG-CBOR value to the JSON shape used by the AT Protocol data model.
pub fn ipld_to_json(ipld: Ipld) -> serde_json::Value {
    use serde_json::Value;

    match ipld {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(b),
        Ipld::Integer(i) => match i64::try_from(i) {
            Ok(i) => Value::from(i),
            Err(_) => Value::String(i.to_string()),
        },
        Ipld::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s),
        Ipld::Bytes(bytes) => {
            serde_json::json!({ "$bytes": general_purpose::STANDARD_NO_PAD.encode(bytes) })
        }
        Ipld::List(items) => Value::Array(items.into_iter().map(ipld_to_json).collect()),
        Ipld::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, ipld_to_json(v)))
                .collect(),
        ),
        Ipld::Link(cid) => serde_json::json!({ "$link": cid.to_string() }),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::BTreeMap;

    pub(crate) fn make_frame<T: Serialize>(op: i32, t: Option<&str>, payload: &T) -> Vec<u8> {
        #[derive(Serialize)]
        struct Header<'a> {
            op: i32,
            #[serde(skip_serializing_if = "Option::is_none")]
            t: Option<&'a str>,
        }

        let mut data = serde_ipld_dagcbor::to_vec(&Header { op, t }).unwrap();
        data.extend(serde_ipld_dagcbor::to_vec(payload).unwrap());
        data
    }

    #[derive(Serialize)]
    pub(crate) struct TestOp {
        pub action: String,
        pub path: String,
        pub cid: Option<Cid>,
    }

    #[derive(Serialize)]
    pub(crate) struct TestCommit {
        pub seq: i64,
        pub repo: String,
        pub rev: String,
        pub ops: Vec<TestOp>,
        pub time: String,
    }

    pub(crate) fn commit_frame(seq: i64, repo: &str, paths: &[(&str, &str)]) -> Vec<u8> {
        make_frame(
            1,
            Some("#commit"),
            &TestCommit {
                seq,
                repo: repo.to_string(),
                rev: format!("rev{}", seq),
                ops: paths
                    .iter()
                    .map(|(action, path)| TestOp {
                        action: action.to_string(),
                        path: path.to_string(),
                        cid: None,
                    })
                    .collect(),
                time: "2024-01-01T00:00:00Z".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_decode_commit_preserves_op_order() {
        let frame = commit_frame(
            100,
            "did:plc:alice",
            &[
                ("create", "app.bsky.feed.post/aaa"),
                ("update", "app.bsky.actor.profile/self"),
                ("delete", "app.bsky.feed.like/bbb"),
            ],
        );

        let DecodedFrame::Event(event) = decode_frame(&frame).await.unwrap() else {
            panic!("expected event");
        };

        assert_eq!(event.sequence, 100);
        assert_eq!(event.did, "did:plc:alice");
        assert_eq!(event.kind, EventKind::Commit);
        assert_eq!(event.rev.as_deref(), Some("rev100"));
        let actions: Vec<OpAction> = event.ops.iter().map(|op| op.action).collect();
        assert_eq!(
            actions,
            vec![OpAction::Create, OpAction::Update, OpAction::Delete]
        );
        assert_eq!(event.ops[1].collection, "app.bsky.actor.profile");
        assert_eq!(event.ops[1].rkey, "self");
        assert!(event.ops.iter().all(|op| op.value.is_none()));
    }

    #[tokio::test]
    async fn test_decode_commit_skips_malformed_paths() {
        let frame = commit_frame(
            5,
            "did:plc:alice",
            &[
                ("create", "no-slash"),
                ("create", "app.bsky.feed.post/ok"),
                ("explode", "app.bsky.feed.post/weird"),
            ],
        );

        let DecodedFrame::Event(event) = decode_frame(&frame).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.ops.len(), 1);
        assert_eq!(event.ops[0].rkey, "ok");
    }

    #[tokio::test]
    async fn test_decode_identity_and_account() {
        #[derive(Serialize)]
        struct Identity {
            seq: i64,
            did: String,
            time: String,
            handle: String,
        }
        #[derive(Serialize)]
        struct Account {
            seq: i64,
            did: String,
            time: String,
            active: bool,
            status: String,
        }

        let frame = make_frame(
            1,
            Some("#identity"),
            &Identity {
                seq: 9,
                did: "did:plc:bob".to_string(),
                time: "2024-01-01T00:00:00Z".to_string(),
                handle: "bob.example.com".to_string(),
            },
        );
        let DecodedFrame::Event(event) = decode_frame(&frame).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::Identity);
        assert_eq!(
            event.identity.unwrap().handle.as_deref(),
            Some("bob.example.com")
        );

        let frame = make_frame(
            1,
            Some("#account"),
            &Account {
                seq: 10,
                did: "did:plc:bob".to_string(),
                time: "2024-01-01T00:00:00Z".to_string(),
                active: false,
                status: "takendown".to_string(),
            },
        );
        let DecodedFrame::Event(event) = decode_frame(&frame).await.unwrap() else {
            panic!("expected event");
        };
        assert_eq!(event.kind, EventKind::Account);
        let account = event.account.unwrap();
        assert!(!account.active);
        assert_eq!(account.status.as_deref(), Some("takendown"));
    }

    #[tokio::test]
    async fn test_error_frame_is_transport_error() {
        #[derive(Serialize)]
        struct Error {
            error: String,
            message: String,
        }

        let frame = make_frame(
            -1,
            None,
            &Error {
                error: "FutureCursor".to_string(),
                message: "cursor is in the future".to_string(),
            },
        );
        let err = decode_frame(&frame).await.unwrap_err();
        assert!(err.is_transport());
        assert!(matches!(
            err,
            FirehoseError::ErrorFrame { ref error_type, .. } if error_type == "FutureCursor"
        ));
    }

    #[tokio::test]
    async fn test_malformed_payload_reports_sequence() {
        #[derive(Serialize)]
        struct Broken {
            seq: i64,
            repo: i64,
        }

        let frame = make_frame(1, Some("#commit"), &Broken { seq: 77, repo: 3 });
        let err = decode_frame(&frame).await.unwrap_err();
        assert!(!err.is_transport());
        assert!(matches!(err, FirehoseError::PayloadDecode { seq: Some(77), .. }));
    }

    #[tokio::test]
    async fn test_garbage_header() {
        let err = decode_frame(&[0xff, 0x00, 0x13]).await.unwrap_err();
        assert!(matches!(err, FirehoseError::HeaderDecode { .. }));
    }

    #[tokio::test]
    async fn test_sync_frame_is_sequenced() {
        #[derive(Serialize)]
        struct Sync {
            seq: i64,
            did: String,
        }

        let frame = make_frame(
            1,
            Some("#sync"),
            &Sync {
                seq: 12,
                did: "did:plc:alice".to_string(),
            },
        );
        let decoded = decode_frame(&frame).await.unwrap();
        assert!(matches!(decoded, DecodedFrame::Sequenced { seq: 12, .. }));
    }

    #[test]
    fn test_ipld_to_json() {
        let mut map = BTreeMap::new();
        map.insert("text".to_string(), Ipld::String("hello".to_string()));
        map.insert("count".to_string(), Ipld::Integer(3));
        map.insert("raw".to_string(), Ipld::Bytes(vec![1, 2, 3]));
        map.insert(
            "langs".to_string(),
            Ipld::List(vec![Ipld::String("en".to_string())]),
        );

        let value = ipld_to_json(Ipld::Map(map));
        assert_eq!(value["text"], "hello");
        assert_eq!(value["count"], 3);
        assert_eq!(value["raw"]["$bytes"], "AQID");
        assert_eq!(value["langs"][0], "en");
    }
}
