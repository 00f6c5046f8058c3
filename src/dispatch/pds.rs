use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::json;

use super::{AccountHostService, ApplyOutcome, classify_response};
use crate::errors::DispatchError;

/// Admin client for the account host (PDS).
pub struct PdsAdminClient {
    http: reqwest::Client,
    host: String,
    admin_token: String,
}

impl PdsAdminClient {
    pub fn new(http: reqwest::Client, host: &str, admin_token: &str) -> Self {
        Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            admin_token: admin_token.to_string(),
        }
    }

    fn authorization(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("admin:{}", self.admin_token))
        )
    }
}

#[async_trait]
impl AccountHostService for PdsAdminClient {
    async fn takedown(&self, did: &str, reference: &str) -> Result<ApplyOutcome, DispatchError> {
        let body = json!({
            "subject": {
                "$type": "com.atproto.admin.defs#repoRef",
                "did": did,
            },
            "takedown": {
                "applied": true,
                "ref": reference,
            },
        });

        let response = self
            .http
            .post(format!(
                "{}/xrpc/com.atproto.admin.updateSubjectStatus",
                self.host
            ))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&body)
            .send()
            .await?;
        classify_response(response).await
    }

    /// Admin routes check auth before parameters, so a bare status query
    /// answers 401 or 403 only when the token is wrong.
    async fn verify(&self) -> Result<(), DispatchError> {
        let response = self
            .http
            .get(format!(
                "{}/xrpc/com.atproto.admin.getSubjectStatus",
                self.host
            ))
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await?;
        let status = response.status();
        match status.as_u16() {
            401 | 403 => Err(DispatchError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
            429 => Err(DispatchError::RateLimited {
                body: response.text().await.unwrap_or_default(),
            }),
            code if code >= 500 => Err(DispatchError::Server {
                status: code,
                body: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }
}
