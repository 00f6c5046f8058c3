//! Built-in moderation rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::effect::{AccountAction, Effect, EffectTarget, Severity};
use super::sets::StaticSets;
use crate::errors::RuleError;
use crate::event::{EventKind, FirehoseEvent, OpAction, RecordOp};
use crate::identity::Identity;

pub const BAD_WORDS_SET: &str = "bad-words";
pub const WATCH_ACCOUNTS_SET: &str = "watch-accounts";

const POST_COLLECTION: &str = "app.bsky.feed.post";
const REASON_RUDE: &str = "com.atproto.moderation.defs#reasonRude";

/// Everything a rule may look at for one event.
pub struct RuleContext<'a> {
    pub event: &'a FirehoseEvent,
    pub identity: Option<&'a Identity>,
    pub sets: &'a StaticSets,
}

impl RuleContext<'_> {
    /// Created or updated posts in commit order.
    fn posts(&self) -> impl Iterator<Item = &RecordOp> {
        self.event.ops.iter().filter(|op| {
            op.collection == POST_COLLECTION
                && matches!(op.action, OpAction::Create | OpAction::Update)
        })
    }
}

#[async_trait]
pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Rules that inspect media embeds or blobs.
    fn uses_blobs(&self) -> bool {
        false
    }

    /// Static sets that must exist for the rule to run.
    fn required_sets(&self) -> &'static [&'static str] {
        &[]
    }

    async fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Effect>, RuleError>;
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
}

fn post_text<'a>(op: &'a RecordOp) -> Result<Option<&'a str>, RuleError> {
    let Some(value) = op.value.as_ref() else {
        return Ok(None);
    };
    match value.get("text") {
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        None | Some(Value::Null) => Ok(None),
        Some(other) => Err(RuleError::RecordShape {
            collection: op.collection.clone(),
            details: format!("text is not a string: {}", other),
        }),
    }
}

fn has_image_embed(value: &Value) -> bool {
    value.get("embed").is_some_and(is_media_embed)
}

fn is_media_embed(embed: &Value) -> bool {
    match embed.get("$type").and_then(Value::as_str) {
        Some("app.bsky.embed.images") | Some("app.bsky.embed.video") => true,
        Some("app.bsky.embed.recordWithMedia") => embed.get("media").is_some_and(is_media_embed),
        _ => false,
    }
}

/// Reports posts whose text contains a word from the bad-words set.
pub struct BannedWordsPost;

#[async_trait]
impl Rule for BannedWordsPost {
    fn name(&self) -> &'static str {
        "banned-words-post"
    }

    fn required_sets(&self) -> &'static [&'static str] {
        &[BAD_WORDS_SET]
    }

    async fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Effect>, RuleError> {
        let mut effects = Vec::new();
        for op in ctx.posts() {
            let Some(text) = post_text(op)? else {
                continue;
            };
            if let Some(word) = tokenize(text).find(|token| ctx.sets.contains(BAD_WORDS_SET, token)) {
                effects.push(
                    Effect::report(
                        EffectTarget::record(op.at_uri(&ctx.event.did), op.cid.clone()),
                        REASON_RUDE,
                        self.name(),
                    )
                    .with_reason(format!("post contains banned word: {}", word))
                    .with_severity(Severity::Medium),
                );
            }
        }
        Ok(effects)
    }
}

/// Labels accounts whose new handle contains a bad word.
pub struct BannedWordsHandle;

#[async_trait]
impl Rule for BannedWordsHandle {
    fn name(&self) -> &'static str {
        "banned-words-handle"
    }

    fn required_sets(&self) -> &'static [&'static str] {
        &[BAD_WORDS_SET]
    }

    async fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Effect>, RuleError> {
        if ctx.event.kind != EventKind::Identity {
            return Ok(vec![]);
        }
        let handle = ctx
            .event
            .identity
            .as_ref()
            .and_then(|change| change.handle.as_deref())
            .or_else(|| ctx.identity.and_then(|identity| identity.handle.as_deref()));
        let Some(handle) = handle else {
            return Ok(vec![]);
        };

        match tokenize(handle).find(|token| ctx.sets.contains(BAD_WORDS_SET, token)) {
            Some(word) => Ok(vec![
                Effect::label(
                    EffectTarget::account(&ctx.event.did),
                    "needs-review",
                    self.name(),
                )
                .with_reason(format!("handle {} contains banned word: {}", handle, word))
                .with_metadata("handle", Value::String(handle.to_string())),
            ]),
            None => Ok(vec![]),
        }
    }
}

/// Labels accounts that post more than a threshold within a sliding window.
///
/// Post times come from the event's arrival time, so the window slides with
/// the stream rather than with the worker that happens to evaluate it.
pub struct PostBurst {
    recent: Cache<String, Arc<Mutex<VecDeque<DateTime<Utc>>>>>,
    threshold: u64,
    window: chrono::Duration,
}

impl PostBurst {
    pub fn new(threshold: u64, window: Duration) -> Self {
        Self {
            recent: Cache::builder()
                .max_capacity(1_000_000)
                .time_to_idle(window)
                .build(),
            threshold,
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::days(3650)),
        }
    }
}

#[async_trait]
impl Rule for PostBurst {
    fn name(&self) -> &'static str {
        "post-burst"
    }

    async fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Effect>, RuleError> {
        let created = ctx
            .event
            .ops
            .iter()
            .filter(|op| op.collection == POST_COLLECTION && op.action == OpAction::Create)
            .count();
        if created == 0 {
            return Ok(vec![]);
        }

        let posted_at = ctx.event.received_at;
        let recent = self
            .recent
            .get_with(ctx.event.did.clone(), async {
                Arc::new(Mutex::new(VecDeque::new()))
            })
            .await;

        let (before, after) = {
            let mut recent = recent.lock();
            if let Some(cutoff) = posted_at.checked_sub_signed(self.window) {
                while recent.front().is_some_and(|at| *at <= cutoff) {
                    recent.pop_front();
                }
            }
            let before = recent.len() as u64;
            recent.extend(std::iter::repeat_n(posted_at, created));
            (before, recent.len() as u64)
        };

        // Fire when the window first crosses the threshold.
        if before <= self.threshold && after > self.threshold {
            return Ok(vec![
                Effect::label(EffectTarget::account(&ctx.event.did), "spam", self.name())
                    .with_reason(format!("{} posts within burst window", after))
                    .with_severity(Severity::Medium),
            ]);
        }
        Ok(vec![])
    }
}

/// Escalates media posts from watched accounts for human review.
pub struct WatchedAccountMedia;

#[async_trait]
impl Rule for WatchedAccountMedia {
    fn name(&self) -> &'static str {
        "watched-account-media"
    }

    fn uses_blobs(&self) -> bool {
        true
    }

    fn required_sets(&self) -> &'static [&'static str] {
        &[WATCH_ACCOUNTS_SET]
    }

    async fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Effect>, RuleError> {
        if !ctx.sets.contains(WATCH_ACCOUNTS_SET, &ctx.event.did) {
            return Ok(vec![]);
        }
        let media_post = ctx
            .posts()
            .filter(|op| op.action == OpAction::Create)
            .find(|op| op.value.as_ref().is_some_and(has_image_embed));

        match media_post {
            Some(op) => Ok(vec![
                Effect::account_action(&ctx.event.did, AccountAction::Escalate, self.name())
                    .with_reason(format!("watched account posted media: {}", op.at_uri(&ctx.event.did)))
                    .with_severity(Severity::High),
            ]),
            None => Ok(vec![]),
        }
    }
}

/// Acknowledges open reports on watched accounts that were deleted.
pub struct TombstoneReview;

#[async_trait]
impl Rule for TombstoneReview {
    fn name(&self) -> &'static str {
        "tombstone-review"
    }

    fn required_sets(&self) -> &'static [&'static str] {
        &[WATCH_ACCOUNTS_SET]
    }

    async fn evaluate(&self, ctx: &RuleContext<'_>) -> Result<Vec<Effect>, RuleError> {
        if ctx.event.kind != EventKind::Tombstone
            || !ctx.sets.contains(WATCH_ACCOUNTS_SET, &ctx.event.did)
        {
            return Ok(vec![]);
        }
        Ok(vec![
            Effect::account_action(&ctx.event.did, AccountAction::Acknowledge, self.name())
                .with_reason("account tombstoned on relay")
                .with_severity(Severity::Info),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::effect::EffectKind;
    use crate::event::IdentityChange;
    use chrono::TimeZone;
    use serde_json::json;

    fn sets() -> StaticSets {
        StaticSets::new()
            .with_set(BAD_WORDS_SET, ["heck"])
            .with_set(WATCH_ACCOUNTS_SET, ["did:plc:watched"])
    }

    fn post(rkey: &str, value: Value) -> RecordOp {
        RecordOp {
            action: OpAction::Create,
            collection: POST_COLLECTION.to_string(),
            rkey: rkey.to_string(),
            cid: Some("bafyreid".to_string()),
            value: Some(value),
        }
    }

    async fn run(rule: &dyn Rule, event: &FirehoseEvent) -> Result<Vec<Effect>, RuleError> {
        let sets = sets();
        rule.evaluate(&RuleContext {
            event,
            identity: None,
            sets: &sets,
        })
        .await
    }

    #[tokio::test]
    async fn test_banned_words_post() {
        let event = FirehoseEvent::commit(
            1,
            "did:plc:alice",
            vec![
                post("1", json!({"text": "what the HECK is this"})),
                post("2", json!({"text": "perfectly fine"})),
            ],
        );
        let effects = run(&BannedWordsPost, &event).await.unwrap();
        assert_eq!(effects.len(), 1);
        assert_eq!(
            effects[0].target,
            EffectTarget::record(
                "at://did:plc:alice/app.bsky.feed.post/1",
                Some("bafyreid".to_string())
            )
        );
        assert!(matches!(effects[0].kind, EffectKind::Report { .. }));
    }

    #[tokio::test]
    async fn test_banned_words_post_rejects_bad_shape() {
        let event = FirehoseEvent::commit(1, "did:plc:alice", vec![post("1", json!({"text": 42}))]);
        assert!(matches!(
            run(&BannedWordsPost, &event).await,
            Err(RuleError::RecordShape { .. })
        ));
    }

    #[tokio::test]
    async fn test_banned_words_handle() {
        let event = FirehoseEvent::new(5, "did:plc:alice", EventKind::Identity, vec![])
            .with_identity(IdentityChange {
                handle: Some("heck-yeah.bsky.social".to_string()),
            });
        let effects = run(&BannedWordsHandle, &event).await.unwrap();
        assert_eq!(effects.len(), 1);
        assert_eq!(
            effects[0].kind,
            EffectKind::Label {
                value: "needs-review".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_post_burst_fires_once() {
        let rule = PostBurst::new(2, Duration::from_secs(60));
        let mut fired = 0;
        for seq in 1..=5 {
            let event = FirehoseEvent::commit(
                seq,
                "did:plc:alice",
                vec![post(&seq.to_string(), json!({"text": "hi"}))],
            );
            fired += run(&rule, &event).await.unwrap().len();
        }
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn test_post_burst_window_slides() {
        let rule = PostBurst::new(3, Duration::from_secs(60));
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        // No aligned minute holds four posts, but 50s..70s does.
        let mut fired = Vec::new();
        for (seq, offset) in [(1, 0), (2, 50), (3, 55), (4, 65), (5, 70)] {
            let mut event = FirehoseEvent::commit(
                seq,
                "did:plc:alice",
                vec![post(&seq.to_string(), json!({"text": "hi"}))],
            );
            event.received_at = start + chrono::Duration::seconds(offset);
            if !run(&rule, &event).await.unwrap().is_empty() {
                fired.push(seq);
            }
        }
        assert_eq!(fired, vec![5]);
    }

    #[tokio::test]
    async fn test_post_burst_forgets_old_posts() {
        let rule = PostBurst::new(2, Duration::from_secs(60));
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

        let mut fired = 0;
        for (seq, offset) in [(1, 0), (2, 40), (3, 100), (4, 160)] {
            let mut event = FirehoseEvent::commit(
                seq,
                "did:plc:alice",
                vec![post(&seq.to_string(), json!({"text": "hi"}))],
            );
            event.received_at = start + chrono::Duration::seconds(offset);
            fired += run(&rule, &event).await.unwrap().len();
        }
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn test_watched_account_media() {
        let image_post = post(
            "1",
            json!({"text": "", "embed": {"$type": "app.bsky.embed.images", "images": []}}),
        );
        let watched = FirehoseEvent::commit(1, "did:plc:watched", vec![image_post.clone()]);
        let other = FirehoseEvent::commit(2, "did:plc:alice", vec![image_post]);

        assert_eq!(run(&WatchedAccountMedia, &watched).await.unwrap().len(), 1);
        assert!(run(&WatchedAccountMedia, &other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_review() {
        let event = FirehoseEvent::new(9, "did:plc:watched", EventKind::Tombstone, vec![]);
        let effects = run(&TombstoneReview, &event).await.unwrap();
        assert_eq!(
            effects[0].kind,
            EffectKind::AccountAction {
                action: AccountAction::Acknowledge
            }
        );
    }
}
