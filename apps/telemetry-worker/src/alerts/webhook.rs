use crate::model::{DeliveryOutcome, DeliveryStatus, Webhook};
use anyhow::Result;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub event: String,
    pub alert_type: String,
    pub tenant_id: i32,
    pub organization_id: i32,
    pub workspace_id: i32,
    pub timestamp: i64,
}

/// `quota_items_80` -> `quota_80`. Tags with fewer than three parts are
/// already event names.
pub fn event_name(alert_type: &str) -> String {
    let parts: Vec<&str> = alert_type.split('_').collect();
    if parts.len() >= 3 {
        format!("{}_{}", parts[0], parts[parts.len() - 1])
    } else {
        alert_type.to_string()
    }
}

pub fn matches_workspace(filter: &[i32], workspace_id: i32) -> bool {
    filter.is_empty() || filter.contains(&0) || filter.contains(&workspace_id)
}

pub fn webhook_matches(webhook: &Webhook, organization_id: i32, workspace_id: i32, event: &str) -> bool {
    let has_url = webhook
        .url
        .as_deref()
        .map(str::trim)
        .is_some_and(|url| !url.is_empty());
    has_url
        && (webhook.organization_id == 0 || webhook.organization_id == organization_id)
        && matches_workspace(&webhook.workspace_ids, workspace_id)
        && (webhook.event_types.is_empty() || webhook.event_types.iter().any(|e| e == event))
}

/// Lowercase hex HMAC-SHA256 of `body`.
pub fn sign_payload(secret: &[u8], body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Single-attempt webhook POST. Failures end up on the delivery row, they are
/// never raised.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    retry_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration, retry_delay: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            retry_delay,
        })
    }

    pub async fn deliver(&self, webhook: &Webhook, payload: &WebhookPayload) -> DeliveryOutcome {
        match self.post(webhook, payload).await {
            Ok(()) => DeliveryOutcome {
                status: DeliveryStatus::Sent,
                last_error: None,
                next_retry_at: None,
            },
            Err(err) => {
                tracing::warn!(
                    webhook_id = webhook.id,
                    alert_type = %payload.alert_type,
                    error = %err,
                    "webhook delivery failed"
                );
                let delay = chrono::Duration::from_std(self.retry_delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5));
                DeliveryOutcome {
                    status: DeliveryStatus::Failed,
                    last_error: Some(err),
                    next_retry_at: Some(Utc::now() + delay),
                }
            }
        }
    }

    async fn post(&self, webhook: &Webhook, payload: &WebhookPayload) -> Result<(), String> {
        let url = webhook
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| "webhook has no url".to_string())?;
        let body = serde_json::to_vec(payload).map_err(|err| err.to_string())?;

        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = webhook.secret.as_deref().filter(|s| !s.is_empty()) {
            let signature = sign_payload(secret.as_bytes(), &body).map_err(|err| err.to_string())?;
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("webhook responded with HTTP {}", status.as_u16()))
        }
    }
}
