//! Payment gateway webhook ingestion
//!
//! The gateway retries until it sees HTTP 200, so this endpoint always
//! returns 200 with a status of `processed` or `ignored`. Rejections
//! (bad signature, unknown topic, sync failure) are logged with their
//! reason but never echoed back: the polling fallback re-converges
//! anything a dropped notification would have carried.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agendou_billing::{SyncAction, Verification, WebhookRequest};

use crate::state::AppState;

/// Notification query parameters. The gateway uses `type`/`data.id` on
/// newer notifications and `topic`/`id` on older ones.
#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub topic: Option<String>,
    #[serde(rename = "data.id")]
    pub data_id: Option<String>,
    pub id: Option<String>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub ok: bool,
    pub status: &'static str,
}

fn processed() -> Json<WebhookResponse> {
    Json(WebhookResponse {
        ok: true,
        status: "processed",
    })
}

fn ignored() -> Json<WebhookResponse> {
    Json(WebhookResponse {
        ok: true,
        status: "ignored",
    })
}

/// POST /webhooks/mercadopago
pub async fn mercadopago(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Option<Json<Value>>,
) -> Json<WebhookResponse> {
    let body = body.map(|Json(v)| v).unwrap_or(Value::Null);

    let topic = query
        .kind
        .as_deref()
        .or(query.topic.as_deref())
        .or_else(|| body.get("type").and_then(Value::as_str))
        .map(str::to_string);
    let resource_id = query
        .data_id
        .clone()
        .or_else(|| query.id.clone())
        .or_else(|| {
            body.pointer("/data/id")
                .and_then(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
        });

    let x_signature = headers.get("x-signature").and_then(|h| h.to_str().ok());
    let x_request_id = headers.get("x-request-id").and_then(|h| h.to_str().ok());

    let verification = state.signature.verify(&WebhookRequest {
        x_signature,
        x_request_id,
        topic: topic.as_deref(),
        resource_id: resource_id.as_deref(),
    });
    let resource_id = match verification {
        Verification::Valid { resource_id } => resource_id,
        Verification::Invalid(failure) => {
            tracing::warn!(failure = ?failure, "Webhook signature rejected");
            return ignored();
        }
    };

    let result = match topic.as_deref() {
        Some("payment") => state.synchronizer.sync_payment(&resource_id).await,
        Some("subscription_preapproval") | Some("preapproval") => {
            state.synchronizer.sync_subscription(&resource_id).await
        }
        other => {
            tracing::debug!(topic = ?other, "Webhook topic not handled");
            return ignored();
        }
    };

    match result {
        Ok(SyncAction::Ignored { reason }) => {
            tracing::debug!(resource_id = %resource_id, reason = %reason, "Webhook ignored");
            ignored()
        }
        Ok(action) => {
            tracing::info!(resource_id = %resource_id, action = ?action, "Webhook processed");
            processed()
        }
        Err(e) => {
            // The polling fallback will retry; no point asking the
            // gateway to hammer a failing path
            tracing::error!(resource_id = %resource_id, error = %e, "Webhook sync failed");
            ignored()
        }
    }
}
