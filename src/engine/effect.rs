//! Moderation effects produced by rule evaluation.

use metrohash::MetroHash64;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountAction {
    Takedown,
    Escalate,
    Acknowledge,
}

impl AccountAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountAction::Takedown => "takedown",
            AccountAction::Escalate => "escalate",
            AccountAction::Acknowledge => "acknowledge",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EffectKind {
    Label { value: String },
    Report { reason_type: String },
    AccountAction { action: AccountAction },
    EventReroute,
}

impl EffectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectKind::Label { .. } => "label",
            EffectKind::Report { .. } => "report",
            EffectKind::AccountAction { .. } => "account-action",
            EffectKind::EventReroute => "event-reroute",
        }
    }

    fn detail(&self) -> &str {
        match self {
            EffectKind::Label { value } => value,
            EffectKind::Report { reason_type } => reason_type,
            EffectKind::AccountAction { action } => action.as_str(),
            EffectKind::EventReroute => "",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EffectTarget {
    Account { did: String },
    Record { uri: String, cid: Option<String> },
}

impl EffectTarget {
    pub fn account(did: impl Into<String>) -> Self {
        EffectTarget::Account { did: did.into() }
    }

    pub fn record(uri: impl Into<String>, cid: Option<String>) -> Self {
        EffectTarget::Record {
            uri: uri.into(),
            cid,
        }
    }

    /// The DID owning the target.
    pub fn did(&self) -> &str {
        match self {
            EffectTarget::Account { did } => did,
            EffectTarget::Record { uri, .. } => uri
                .strip_prefix("at://")
                .and_then(|rest| rest.split('/').next())
                .unwrap_or(uri),
        }
    }

    fn subject(&self) -> String {
        match self {
            EffectTarget::Account { did } => did.clone(),
            EffectTarget::Record { uri, cid } => {
                format!("{}#{}", uri, cid.as_deref().unwrap_or(""))
            }
        }
    }
}

impl fmt::Display for EffectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectTarget::Account { did } => write!(f, "{}", did),
            EffectTarget::Record { uri, .. } => write!(f, "{}", uri),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    #[serde(flatten)]
    pub kind: EffectKind,
    pub target: EffectTarget,
    pub reason: String,
    pub source_rule: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Effect {
    pub fn new(kind: EffectKind, target: EffectTarget, source_rule: &str) -> Self {
        Self {
            kind,
            target,
            reason: String::new(),
            source_rule: source_rule.to_string(),
            severity: Severity::default(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn label(target: EffectTarget, value: &str, source_rule: &str) -> Self {
        Self::new(
            EffectKind::Label {
                value: value.to_string(),
            },
            target,
            source_rule,
        )
    }

    pub fn report(target: EffectTarget, reason_type: &str, source_rule: &str) -> Self {
        Self::new(
            EffectKind::Report {
                reason_type: reason_type.to_string(),
            },
            target,
            source_rule,
        )
    }

    pub fn account_action(did: &str, action: AccountAction, source_rule: &str) -> Self {
        Self::new(
            EffectKind::AccountAction { action },
            EffectTarget::account(did),
            source_rule,
        )
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Key identifying the downstream write this effect produces for the
    /// event at `sequence`.
    ///
    /// Replaying or retrying the same event yields the same key. A later event
    /// producing the same kind of effect on the same target gets a new key and
    /// is delivered again.
    pub fn idempotency_key(&self, sequence: i64) -> String {
        let subject = self.target.subject();
        let mut hasher = MetroHash64::new();
        hasher.write(&sequence.to_be_bytes());
        for part in [
            self.kind.as_str(),
            self.kind.detail(),
            subject.as_str(),
            self.source_rule.as_str(),
            self.reason.as_str(),
        ] {
            hasher.write(b"\x1f");
            hasher.write(part.as_bytes());
        }
        format!("{:016x}", hasher.finish())
    }
}
