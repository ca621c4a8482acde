//! Outbound dunning messages
//!
//! The dunning monitor talks to the messaging service through the
//! `MessageTransport` seam, so tests can swap in a recording fake. The
//! production transport posts to the platform's internal dispatch
//! endpoint, which owns templating and WhatsApp session handling.

use std::future::Future;

use agendou_shared::ReminderChannel;

use crate::error::BillingResult;

/// One reminder ready to leave the building
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: ReminderChannel,
    /// Email address or WhatsApp number, per channel
    pub to: String,
    /// Subject line; ignored by the WhatsApp channel
    pub subject: String,
    pub body: String,
}

/// Transport seam for dunning reminders.
///
/// `Ok(true)` means delivered to the dispatcher, `Ok(false)` means the
/// send failed non-fatally (the reminder reservation is released and a
/// later tick retries). `Err` is reserved for configuration problems.
pub trait MessageTransport: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> impl Future<Output = BillingResult<bool>> + Send;
}

/// Messenger dispatch configuration
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Internal dispatch endpoint; empty disables sending
    pub dispatch_url: String,
    /// Shared secret for the dispatch endpoint
    pub api_key: String,
}

impl MessengerConfig {
    pub fn from_env() -> Self {
        Self {
            dispatch_url: std::env::var("MESSENGER_DISPATCH_URL").unwrap_or_default(),
            api_key: std::env::var("MESSENGER_API_KEY").unwrap_or_default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.dispatch_url.is_empty()
    }
}

/// Production transport: POSTs to the internal messaging dispatcher
#[derive(Clone)]
pub struct HttpMessenger {
    config: MessengerConfig,
    client: reqwest::Client,
}

impl HttpMessenger {
    pub fn new(config: MessengerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(MessengerConfig::from_env())
    }
}

impl MessageTransport for HttpMessenger {
    async fn send(&self, message: &OutboundMessage) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                channel = %message.channel,
                "Messenger not configured, skipping reminder"
            );
            return Ok(false);
        }

        let body = serde_json::json!({
            "channel": message.channel,
            "to": message.to,
            "subject": message.subject,
            "body": message.body,
        });

        let response = self
            .client
            .post(&self.config.dispatch_url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(channel = %message.channel, "Dunning reminder dispatched");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                tracing::error!(
                    channel = %message.channel,
                    status = %status,
                    "Failed to dispatch reminder - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    channel = %message.channel,
                    error = %e,
                    "Failed to dispatch reminder - non-fatal"
                );
                Ok(false)
            }
        }
    }
}
