//! Checkout session creation
//!
//! Mints the self-describing correlation token, creates the gateway-side
//! checkout (a preapproval for subscriptions, a preference for one-off
//! credit packages), and records the local subscription row in `initiated`
//! state. The payer then completes checkout at the returned redirect URL
//! and the webhook/polling path converges the rest.

use agendou_shared::{BillingCycle, Plan, Subscription};
use serde::Serialize;
use uuid::Uuid;

use crate::client::{
    AutoRecurring, BackUrls, CreatePreapproval, CreatePreference, GatewayClient, PreferenceItem,
};
use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionEventLogger, SubscriptionEventType};
use crate::packages::CreditPackage;
use crate::sync::{PlanToken, TOPUP_REFERENCE_PREFIX};

/// What the API returns for a newly created checkout
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResponse {
    /// Gateway id of the created preapproval or preference
    pub gateway_id: String,
    /// Redirect URL the payer completes checkout at
    pub init_point: String,
    /// Correlation token (the gateway `external_reference`)
    pub external_reference: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    pool: sqlx::PgPool,
    gateway: GatewayClient,
    events: SubscriptionEventLogger,
}

impl CheckoutService {
    pub fn new(
        pool: sqlx::PgPool,
        gateway: GatewayClient,
        events: SubscriptionEventLogger,
    ) -> Self {
        Self {
            pool,
            gateway,
            events,
        }
    }

    /// Start a recurring subscription checkout for a tenant
    pub async fn create_subscription_checkout(
        &self,
        tenant_id: Uuid,
        plan: Plan,
        cycle: BillingCycle,
    ) -> BillingResult<CheckoutResponse> {
        let payer_email: Option<Option<String>> =
            sqlx::query_scalar("SELECT email FROM tenants WHERE id = $1")
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        let payer_email = payer_email
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?
            .ok_or_else(|| {
                BillingError::InvalidInput("tenant has no billing email".to_string())
            })?;

        let token = PlanToken::mint(plan, cycle, tenant_id);
        let reference = token.encode();
        let amount_cents = plan.price_cents(cycle);
        let config = self.gateway.config();

        let request = CreatePreapproval {
            reason: format!("Agendou plano {}", plan),
            external_reference: reference.clone(),
            payer_email,
            auto_recurring: AutoRecurring {
                frequency: 1,
                frequency_type: match cycle {
                    BillingCycle::Monthly => "months".to_string(),
                    BillingCycle::Yearly => "years".to_string(),
                },
                transaction_amount: amount_cents as f64 / 100.0,
                currency_id: config.currency.clone(),
            },
            back_url: format!("{}/configuracoes/plano", config.app_base_url),
            status: "pending".to_string(),
        };

        let created = self.gateway.create_preapproval(&request).await?;

        let mut tx = self.pool.begin().await?;
        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (tenant_id, plan, billing_cycle, status, amount_cents, currency,
                 gateway_subscription_id, external_reference)
            VALUES ($1, $2, $3, 'initiated', $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(plan)
        .bind(cycle)
        .bind(amount_cents)
        .bind(&config.currency)
        .bind(&created.id)
        .bind(&reference)
        .fetch_one(&mut *tx)
        .await?;

        self.events
            .append(
                &mut *tx,
                subscription.id,
                SubscriptionEventType::CheckoutInitiated,
                Some(&created.id),
                serde_json::json!({ "plan": plan, "cycle": cycle, "amount_cents": amount_cents }),
            )
            .await?;
        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            plan = %plan,
            cycle = %cycle,
            "Subscription checkout created"
        );

        Ok(CheckoutResponse {
            gateway_id: created.id,
            init_point: created.init_point,
            external_reference: reference,
        })
    }

    /// Start a one-off checkout for a message credit package. No local row
    /// is created: the approved payment's reference alone is enough for
    /// the synchronizer to credit the wallet.
    pub async fn create_topup_checkout(
        &self,
        tenant_id: Uuid,
        package: CreditPackage,
    ) -> BillingResult<CheckoutResponse> {
        let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(BillingError::TenantNotFound(tenant_id.to_string()));
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let reference = format!(
            "{}{}:est:{}:{}",
            TOPUP_REFERENCE_PREFIX,
            package.id(),
            tenant_id,
            nonce
        );
        let config = self.gateway.config();

        let request = CreatePreference {
            items: vec![PreferenceItem {
                title: package.title(),
                quantity: 1,
                unit_price: package.price_cents() as f64 / 100.0,
                currency_id: config.currency.clone(),
            }],
            external_reference: reference.clone(),
            notification_url: config.notification_url.clone(),
            back_urls: BackUrls {
                success: format!("{}/configuracoes/creditos?status=ok", config.app_base_url),
                failure: format!("{}/configuracoes/creditos?status=erro", config.app_base_url),
                pending: format!(
                    "{}/configuracoes/creditos?status=pendente",
                    config.app_base_url
                ),
            },
        };

        let created = self.gateway.create_preference(&request).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            package = %package,
            preference_id = %created.id,
            "Top-up checkout created"
        );

        Ok(CheckoutResponse {
            gateway_id: created.id,
            init_point: created.init_point,
            external_reference: reference,
        })
    }
}
