//! Rule evaluation.
//!
//! A [`Ruleset`] is chosen once at startup and turned into a [`RulesetEngine`]
//! holding the concrete rule list. Workers only see the [`RuleEngine`] trait.
//!
//! Rules run in a fixed order and their effects are returned in that order.
//! A failing rule fails the whole evaluation; the caller treats that as an
//! event with no effects.

pub mod effect;
pub mod rules;
pub mod sets;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::errors::{ConfigError, RuleError};
use crate::event::FirehoseEvent;
use crate::identity::Identity;

pub use effect::{AccountAction, Effect, EffectKind, EffectTarget, Severity};
pub use rules::{Rule, RuleContext};
pub use sets::StaticSets;

#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Evaluate one event. `identity` is `None` when it could not be resolved.
    async fn evaluate(
        &self,
        event: &FirehoseEvent,
        identity: Option<&Identity>,
    ) -> Result<Vec<Effect>, RuleError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ruleset {
    Default,
    NoBlobs,
    OnlyBlobs,
}

impl Ruleset {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name.trim() {
            "" | "default" | "default-rules" => Ok(Ruleset::Default),
            "no-blobs" | "no-blob-rules" => Ok(Ruleset::NoBlobs),
            "only-blobs" | "only-blob-rules" => Ok(Ruleset::OnlyBlobs),
            other => Err(ConfigError::UnknownRuleset {
                name: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Ruleset::Default => "default",
            Ruleset::NoBlobs => "no-blobs",
            Ruleset::OnlyBlobs => "only-blobs",
        }
    }

    fn includes(&self, rule: &dyn Rule) -> bool {
        match self {
            Ruleset::Default => true,
            Ruleset::NoBlobs => !rule.uses_blobs(),
            Ruleset::OnlyBlobs => rule.uses_blobs(),
        }
    }
}

impl TryFrom<String> for Ruleset {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_name(&value)
    }
}

#[derive(Clone, Debug)]
pub struct RuleSettings {
    pub burst_threshold: u64,
    pub burst_window: Duration,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            burst_threshold: 30,
            burst_window: Duration::from_secs(60 * 60),
        }
    }
}

pub struct RulesetEngine {
    ruleset: Ruleset,
    rules: Vec<Box<dyn Rule>>,
    sets: Arc<StaticSets>,
}

impl RulesetEngine {
    /// Build the rule list for `ruleset`. Fails when a selected rule needs a
    /// static set that was not loaded.
    pub fn new(
        ruleset: Ruleset,
        sets: Arc<StaticSets>,
        settings: RuleSettings,
    ) -> Result<Self, ConfigError> {
        let all: Vec<Box<dyn Rule>> = vec![
            Box::new(rules::BannedWordsPost),
            Box::new(rules::BannedWordsHandle),
            Box::new(rules::PostBurst::new(
                settings.burst_threshold,
                settings.burst_window,
            )),
            Box::new(rules::WatchedAccountMedia),
            Box::new(rules::TombstoneReview),
        ];

        let rules: Vec<Box<dyn Rule>> = all
            .into_iter()
            .filter(|rule| ruleset.includes(rule.as_ref()))
            .collect();

        for rule in &rules {
            for set_name in rule.required_sets() {
                if sets.get(set_name).is_none() {
                    return Err(ConfigError::MissingStaticSet {
                        ruleset: ruleset.as_str().to_string(),
                        set_name: set_name.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            ruleset,
            rules,
            sets,
        })
    }

    pub fn ruleset(&self) -> Ruleset {
        self.ruleset
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }
}

#[async_trait]
impl RuleEngine for RulesetEngine {
    async fn evaluate(
        &self,
        event: &FirehoseEvent,
        identity: Option<&Identity>,
    ) -> Result<Vec<Effect>, RuleError> {
        let ctx = RuleContext {
            event,
            identity,
            sets: self.sets.as_ref(),
        };

        let mut effects = Vec::new();
        for rule in &self.rules {
            let produced = rule.evaluate(&ctx).await?;
            if !produced.is_empty() {
                debug!(
                    rule = rule.name(),
                    seq = event.sequence,
                    did = %event.did,
                    count = produced.len(),
                    "Rule produced effects"
                );
            }
            effects.extend(produced);
        }
        Ok(effects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, OpAction, RecordOp};
    use serde_json::json;

    fn full_sets() -> Arc<StaticSets> {
        Arc::new(
            StaticSets::new()
                .with_set(rules::BAD_WORDS_SET, ["heck"])
                .with_set(rules::WATCH_ACCOUNTS_SET, ["did:plc:watched"]),
        )
    }

    #[test]
    fn test_ruleset_from_name() {
        assert_eq!(Ruleset::from_name("default").unwrap(), Ruleset::Default);
        assert_eq!(Ruleset::from_name("no-blobs").unwrap(), Ruleset::NoBlobs);
        assert_eq!(Ruleset::from_name("only-blob-rules").unwrap(), Ruleset::OnlyBlobs);
        assert!(matches!(
            Ruleset::from_name("everything"),
            Err(ConfigError::UnknownRuleset { .. })
        ));
    }

    #[test]
    fn test_ruleset_selects_rules() {
        let engine =
            RulesetEngine::new(Ruleset::OnlyBlobs, full_sets(), RuleSettings::default()).unwrap();
        assert_eq!(engine.rule_names(), vec!["watched-account-media"]);

        let engine =
            RulesetEngine::new(Ruleset::NoBlobs, full_sets(), RuleSettings::default()).unwrap();
        assert!(!engine.rule_names().contains(&"watched-account-media"));
        assert_eq!(engine.rule_names().len(), 4);
    }

    #[test]
    fn test_missing_static_set_is_fatal() {
        let sets = Arc::new(StaticSets::new().with_set(rules::BAD_WORDS_SET, ["heck"]));
        assert!(matches!(
            RulesetEngine::new(Ruleset::Default, sets, RuleSettings::default()),
            Err(ConfigError::MissingStaticSet { .. })
        ));
    }

    #[tokio::test]
    async fn test_effects_follow_rule_order() {
        let engine =
            RulesetEngine::new(Ruleset::Default, full_sets(), RuleSettings {
                burst_threshold: 0,
                burst_window: Duration::from_secs(60),
            })
            .unwrap();
        let event = FirehoseEvent::commit(
            1,
            "did:plc:alice",
            vec![RecordOp {
                action: OpAction::Create,
                collection: "app.bsky.feed.post".to_string(),
                rkey: "1".to_string(),
                cid: None,
                value: Some(json!({"text": "heck"})),
            }],
        );

        let effects = engine.evaluate(&event, None).await.unwrap();
        let rules: Vec<&str> = effects.iter().map(|e| e.source_rule.as_str()).collect();
        assert_eq!(rules, vec!["banned-words-post", "post-burst"]);
    }

    #[tokio::test]
    async fn test_unknown_identity_is_valid_input() {
        let engine =
            RulesetEngine::new(Ruleset::Default, full_sets(), RuleSettings::default()).unwrap();
        let event = FirehoseEvent::new(1, "did:plc:alice", EventKind::Account, vec![]);
        assert!(engine.evaluate(&event, None).await.unwrap().is_empty());
    }
}
