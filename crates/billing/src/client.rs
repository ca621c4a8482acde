//! Payment gateway client configuration
//!
//! Thin HTTP client over the Mercado Pago-shaped API: payment lookup,
//! preapproval (recurring subscription) lookup/creation, and checkout
//! preference creation for one-off top-up purchases.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Configuration for the payment gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Gateway API access token
    pub access_token: String,
    /// API base URL (overridable for mock-server tests)
    pub base_url: String,
    /// Base URL the payer returns to after checkout
    pub app_base_url: String,
    /// Webhook delivery URL registered with the gateway
    pub notification_url: String,
    /// Currency for all charges
    pub currency: String,
    /// Outbound request timeout in seconds
    pub request_timeout_secs: u64,
}

impl GatewayConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            access_token: std::env::var("MP_ACCESS_TOKEN")
                .map_err(|_| BillingError::Config("MP_ACCESS_TOKEN not set".to_string()))?,
            base_url: std::env::var("MP_BASE_URL")
                .unwrap_or_else(|_| "https://api.mercadopago.com".to_string()),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            notification_url: std::env::var("MP_NOTIFICATION_URL").unwrap_or_default(),
            currency: std::env::var("BILLING_CURRENCY").unwrap_or_else(|_| "BRL".to_string()),
            request_timeout_secs: std::env::var("MP_REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .unwrap_or(15),
        })
    }
}

/// The gateway encodes ids as numbers on some resources and strings on
/// others; accept both
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Str(s) => s,
        Raw::Num(n) => n.to_string(),
    })
}

/// A payment as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayment {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub status_detail: Option<String>,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub preference_id: Option<String>,
    #[serde(default)]
    pub transaction_amount: Option<f64>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A preapproval (recurring subscription) as reported by the gateway
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPreapproval {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub external_reference: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub next_payment_date: Option<String>,
}

/// Response to creating a preapproval or checkout preference
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutCreated {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Redirect URL the payer completes checkout at
    pub init_point: String,
}

/// Request body for creating a preapproval
#[derive(Debug, Clone, Serialize)]
pub struct CreatePreapproval {
    pub reason: String,
    pub external_reference: String,
    pub payer_email: String,
    pub auto_recurring: AutoRecurring,
    pub back_url: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutoRecurring {
    pub frequency: u32,
    pub frequency_type: String,
    pub transaction_amount: f64,
    pub currency_id: String,
}

/// Request body for creating a checkout preference (one-off purchase)
#[derive(Debug, Clone, Serialize)]
pub struct CreatePreference {
    pub items: Vec<PreferenceItem>,
    pub external_reference: String,
    pub notification_url: String,
    pub back_urls: BackUrls,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub currency_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackUrls {
    pub success: String,
    pub failure: String,
    pub pending: String,
}

/// Payment gateway client
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    /// Create a new gateway client from config
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Create a new gateway client from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    /// Get the config
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Fetch a payment by gateway id
    pub async fn get_payment(&self, payment_id: &str) -> BillingResult<GatewayPayment> {
        let url = format!("{}/v1/payments/{}", self.config.base_url, payment_id);
        self.get_json(&url, "payment").await
    }

    /// Fetch a preapproval (recurring subscription) by gateway id
    pub async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<GatewayPreapproval> {
        let url = format!("{}/preapproval/{}", self.config.base_url, preapproval_id);
        self.get_json(&url, "preapproval").await
    }

    /// Create a preapproval for a recurring subscription
    pub async fn create_preapproval(
        &self,
        req: &CreatePreapproval,
    ) -> BillingResult<CheckoutCreated> {
        let url = format!("{}/preapproval", self.config.base_url);
        self.post_json(&url, req, "preapproval").await
    }

    /// Create a checkout preference for a one-off purchase
    pub async fn create_preference(
        &self,
        req: &CreatePreference,
    ) -> BillingResult<CheckoutCreated> {
        let url = format!("{}/checkout/preferences", self.config.base_url);
        self.post_json(&url, req, "preference").await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        resource: &str,
    ) -> BillingResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.config.access_token)
            .send()
            .await?;
        Self::parse_response(response, resource).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
        resource: &str,
    ) -> BillingResult<T> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(body)
            .send()
            .await?;
        Self::parse_response(response, resource).await
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        resource: &str,
    ) -> BillingResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                resource = %resource,
                status = %status,
                body = %body,
                "Gateway request failed"
            );
            return Err(BillingError::Gateway(format!(
                "{} request failed with status {}",
                resource, status
            )));
        }
        response.json::<T>().await.map_err(|e| {
            tracing::error!(resource = %resource, error = %e, "Failed to parse gateway response");
            BillingError::Gateway(format!("invalid {} response: {}", resource, e))
        })
    }
}
