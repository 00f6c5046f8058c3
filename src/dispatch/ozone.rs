use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ApplyOutcome, ModerationService, classify_response};
use crate::engine::{AccountAction, Effect, EffectKind, EffectTarget};
use crate::errors::DispatchError;

const REASON_OTHER: &str = "com.atproto.moderation.defs#reasonOther";

/// One entry from `tools.ozone.moderation.queryEvents`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationEventView {
    pub id: i64,
    pub event: Value,
    pub subject: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl ModerationEventView {
    pub fn event_type(&self) -> &str {
        self.event
            .get("$type")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryEventsPage {
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub events: Vec<ModerationEventView>,
}

/// Admin client for one Ozone moderation service.
pub struct OzoneClient {
    http: reqwest::Client,
    host: String,
    operator_did: String,
    admin_token: String,
}

impl OzoneClient {
    pub fn new(http: reqwest::Client, host: &str, operator_did: &str, admin_token: &str) -> Self {
        Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            operator_did: operator_did.to_string(),
            admin_token: admin_token.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn operator_did(&self) -> &str {
        &self.operator_did
    }

    fn authorization(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("admin:{}", self.admin_token))
        )
    }

    fn subject(target: &EffectTarget) -> Result<Value, DispatchError> {
        match target {
            EffectTarget::Account { did } => Ok(json!({
                "$type": "com.atproto.admin.defs#repoRef",
                "did": did,
            })),
            EffectTarget::Record { uri, cid: Some(cid) } => Ok(json!({
                "$type": "com.atproto.repo.strongRef",
                "uri": uri,
                "cid": cid,
            })),
            EffectTarget::Record { uri, cid: None } => Err(DispatchError::Unsupported {
                service: "ozone".to_string(),
                details: format!("record subject {} has no cid", uri),
            }),
        }
    }

    /// Build the `emitEvent` body for an effect.
    pub fn event_body(&self, effect: &Effect) -> Result<Value, DispatchError> {
        let comment = if effect.reason.is_empty() {
            format!("[automod] {}", effect.source_rule)
        } else {
            format!("[automod] {}: {}", effect.source_rule, effect.reason)
        };

        let event = match &effect.kind {
            EffectKind::Label { value } => json!({
                "$type": "tools.ozone.moderation.defs#modEventLabel",
                "createLabelVals": [value],
                "negateLabelVals": [],
                "comment": comment,
            }),
            EffectKind::Report { reason_type } => json!({
                "$type": "tools.ozone.moderation.defs#modEventReport",
                "reportType": reason_type,
                "comment": comment,
            }),
            EffectKind::AccountAction { action } => {
                let event_type = match action {
                    AccountAction::Takedown => "tools.ozone.moderation.defs#modEventTakedown",
                    AccountAction::Escalate => "tools.ozone.moderation.defs#modEventEscalate",
                    AccountAction::Acknowledge => {
                        "tools.ozone.moderation.defs#modEventAcknowledge"
                    }
                };
                json!({ "$type": event_type, "comment": comment })
            }
            EffectKind::EventReroute => json!({
                "$type": "tools.ozone.moderation.defs#modEventReport",
                "reportType": REASON_OTHER,
                "comment": comment,
            }),
        };

        Ok(json!({
            "event": event,
            "subject": Self::subject(&effect.target)?,
            "createdBy": self.operator_did,
        }))
    }

    pub async fn emit_event(&self, body: &Value) -> Result<ApplyOutcome, DispatchError> {
        let response = self
            .http
            .post(format!("{}/xrpc/tools.ozone.moderation.emitEvent", self.host))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(body)
            .send()
            .await?;
        classify_response(response).await
    }

    /// Fetch moderation events created strictly after `created_after`, oldest first.
    pub async fn query_events(
        &self,
        created_after: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<QueryEventsPage, DispatchError> {
        let mut query = vec![
            ("sortDirection", "asc".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(after) = created_after {
            query.push((
                "createdAfter",
                after.to_rfc3339_opts(SecondsFormat::Micros, true),
            ));
        }

        let response = self
            .http
            .get(format!("{}/xrpc/tools.ozone.moderation.queryEvents", self.host))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => DispatchError::RateLimited { body },
                code if code >= 500 => DispatchError::Server { status: code, body },
                code => DispatchError::Rejected { status: code, body },
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ModerationService for OzoneClient {
    fn name(&self) -> &str {
        &self.host
    }

    async fn apply(&self, effect: &Effect) -> Result<ApplyOutcome, DispatchError> {
        let body = self.event_body(effect)?;
        self.emit_event(&body).await
    }

    async fn verify(&self) -> Result<(), DispatchError> {
        self.query_events(None, 1).await.map(|_| ())
    }

    async fn forward(&self, source: &ModerationEventView) -> Result<ApplyOutcome, DispatchError> {
        let mut event = source.event.clone();
        if let Some(object) = event.as_object_mut() {
            let original = object
                .get("comment")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            object.insert(
                "comment".to_string(),
                Value::String(format!(
                    "[rerouted from {} event {}] {}",
                    source.created_by, source.id, original
                )),
            );
        }
        let body = json!({
            "event": event,
            "subject": source.subject,
            "createdBy": self.operator_did,
        });
        self.emit_event(&body).await
    }
}
