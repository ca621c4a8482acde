//! Gateway → local subscription state synchronizer
//!
//! Webhooks and the polling fallback both funnel into this module. The
//! gateway is the source of truth: notifications carry only a resource id,
//! so every sync re-fetches the resource and converges local state toward
//! it. Each subscription row carries a watermark (`last_event_id`) checked
//! under a `FOR UPDATE` row lock, making replayed and concurrent
//! notifications no-ops. The gateway reuses one resource id across a
//! resource's lifecycle, so the watermark is `<id>:<mapped_status>`: a
//! pending notification must never swallow the later approval.

use std::str::FromStr;

use agendou_shared::{BillingCycle, Plan, Subscription, SubscriptionStatus};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{GatewayClient, GatewayPayment};
use crate::error::{BillingError, BillingResult};
use crate::events::{SubscriptionEventLogger, SubscriptionEventType};
use crate::wallet::{CreditOutcome, WalletService};

/// Prefix marking one-off top-up payments, which never touch
/// subscription state
pub const TOPUP_REFERENCE_PREFIX: &str = "credits:";

/// What a sync pass did, for the caller's logs and the webhook response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Payment approved; tenant plan activated or renewed
    Activated { tenant_id: Uuid },
    /// Subscription status converged to the gateway's
    StatusChanged { status: SubscriptionStatus },
    /// Top-up payment credited to the tenant's wallet
    TopupCredited { tenant_id: Uuid },
    /// Watermark already covers this notification
    Duplicate,
    /// Nothing actionable in this notification
    Ignored { reason: &'static str },
}

/// Self-describing checkout correlation token, embedded as the gateway
/// `external_reference`. Carries enough state to reconstruct a lost
/// subscription row from the gateway's copy alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanToken {
    pub plan: Plan,
    pub cycle: BillingCycle,
    pub tenant_id: Uuid,
    pub nonce: String,
}

impl PlanToken {
    pub fn mint(plan: Plan, cycle: BillingCycle, tenant_id: Uuid) -> Self {
        Self {
            plan,
            cycle,
            tenant_id,
            nonce: Uuid::new_v4().simple().to_string(),
        }
    }

    /// `plan:pro:cycle:mensal:est:<uuid>:<nonce>`
    pub fn encode(&self) -> String {
        let cycle = match self.cycle {
            BillingCycle::Monthly => "mensal",
            BillingCycle::Yearly => "anual",
        };
        format!(
            "plan:{}:cycle:{}:est:{}:{}",
            self.plan, cycle, self.tenant_id, self.nonce
        )
    }

    pub fn parse(reference: &str) -> Option<Self> {
        let parts: Vec<&str> = reference.split(':').collect();
        if parts.len() != 7 || parts[0] != "plan" || parts[2] != "cycle" || parts[4] != "est" {
            return None;
        }
        let plan = Plan::from_str(parts[1]).ok()?;
        let cycle = BillingCycle::from_str(parts[3]).ok()?;
        let tenant_id = Uuid::parse_str(parts[5]).ok()?;
        if parts[6].is_empty() {
            return None;
        }
        Some(Self {
            plan,
            cycle,
            tenant_id,
            nonce: parts[6].to_string(),
        })
    }
}

/// Map a gateway status string onto the local state machine. Unknown
/// statuses map to None and are ignored rather than guessed at.
pub fn map_status(gateway_status: &str) -> Option<SubscriptionStatus> {
    match gateway_status {
        "authorized" => Some(SubscriptionStatus::Authorized),
        "active" | "approved" => Some(SubscriptionStatus::Active),
        "paused" | "halted" => Some(SubscriptionStatus::Paused),
        "cancelled" | "canceled" => Some(SubscriptionStatus::Canceled),
        "expired" | "finished" => Some(SubscriptionStatus::Expired),
        "pending" | "in_process" | "inprocess" => Some(SubscriptionStatus::Pending),
        "charged_back" | "rejected" => Some(SubscriptionStatus::PastDue),
        _ => None,
    }
}

/// Watermark for a payment notification. The gateway keeps one payment id
/// through the whole payment lifecycle (pending, then approved or
/// rejected), so the mapped status is folded in, mirroring the preapproval
/// watermark.
fn payment_watermark(payment_id: &str, gateway_status: &str) -> String {
    match map_status(gateway_status) {
        Some(status) => format!("{payment_id}:{status}"),
        None => payment_id.to_string(),
    }
}

#[derive(Clone)]
pub struct PaymentSynchronizer {
    pool: PgPool,
    gateway: GatewayClient,
    wallet: WalletService,
    events: SubscriptionEventLogger,
}

impl PaymentSynchronizer {
    pub fn new(
        pool: PgPool,
        gateway: GatewayClient,
        wallet: WalletService,
        events: SubscriptionEventLogger,
    ) -> Self {
        Self {
            pool,
            gateway,
            wallet,
            events,
        }
    }

    /// Sync one payment notification by re-fetching the payment from the
    /// gateway and converging local state
    pub async fn sync_payment(&self, payment_id: &str) -> BillingResult<SyncAction> {
        let payment = self.gateway.get_payment(payment_id).await?;

        let reference = payment.external_reference.as_deref().unwrap_or("");
        if let Some(rest) = reference.strip_prefix(TOPUP_REFERENCE_PREFIX) {
            return self.sync_topup(&payment, rest).await;
        }

        let mut tx = self.pool.begin().await?;
        let subscription = match self.resolve_subscription(&mut tx, &payment).await? {
            Some(sub) => sub,
            None => {
                tx.commit().await?;
                tracing::warn!(
                    payment_id = %payment.id,
                    external_reference = %reference,
                    "Payment does not correlate to any subscription"
                );
                return Ok(SyncAction::Ignored {
                    reason: "unresolvable payment",
                });
            }
        };

        let watermark = payment_watermark(&payment.id, &payment.status);
        if subscription.last_event_id.as_deref() == Some(watermark.as_str()) {
            tx.commit().await?;
            tracing::debug!(payment_id = %payment.id, "Payment already processed");
            return Ok(SyncAction::Duplicate);
        }

        let action = match payment.status.as_str() {
            "approved" => {
                self.apply_approval(&mut tx, &subscription, &payment, &watermark)
                    .await?
            }
            "rejected" => {
                self.apply_subscription_status(
                    &mut tx,
                    &subscription,
                    SubscriptionStatus::PastDue,
                    &watermark,
                )
                .await?;
                self.events
                    .append(
                        &mut *tx,
                        subscription.id,
                        SubscriptionEventType::PaymentRejected,
                        Some(&watermark),
                        serde_json::json!({
                            "status": payment.status,
                            "status_detail": payment.status_detail,
                        }),
                    )
                    .await?;
                SyncAction::StatusChanged {
                    status: SubscriptionStatus::PastDue,
                }
            }
            // Checkout abandoned; the gateway expires the pending payment
            "cancelled" | "canceled"
                if payment.status_detail.as_deref() == Some("expired") =>
            {
                self.cancel_expired_checkout(&mut tx, &subscription, &watermark)
                    .await?
            }
            "pending" | "in_process" | "inprocess" => {
                self.apply_subscription_status(
                    &mut tx,
                    &subscription,
                    SubscriptionStatus::Pending,
                    &watermark,
                )
                .await?;
                SyncAction::StatusChanged {
                    status: SubscriptionStatus::Pending,
                }
            }
            other => {
                tx.commit().await?;
                tracing::debug!(payment_id = %payment.id, status = %other, "Payment status not actionable");
                return Ok(SyncAction::Ignored {
                    reason: "payment status not actionable",
                });
            }
        };

        tx.commit().await?;
        Ok(action)
    }

    /// Sync one preapproval notification. The watermark for preapprovals
    /// is `<id>:<mapped_status>`, since the gateway reports no per-change
    /// event id.
    pub async fn sync_subscription(&self, preapproval_id: &str) -> BillingResult<SyncAction> {
        let preapproval = self.gateway.get_preapproval(preapproval_id).await?;

        let Some(status) = map_status(&preapproval.status) else {
            tracing::debug!(
                preapproval_id = %preapproval.id,
                status = %preapproval.status,
                "Preapproval status not recognized"
            );
            return Ok(SyncAction::Ignored {
                reason: "preapproval status not recognized",
            });
        };
        let watermark = format!("{}:{}", preapproval.id, status);

        let mut tx = self.pool.begin().await?;
        let subscription = self
            .find_by_gateway_subscription(&mut tx, &preapproval.id)
            .await?;
        let subscription = match subscription {
            Some(sub) => sub,
            None => {
                // A lost row is only worth reconstructing when the gateway
                // says money is in motion
                let reference = preapproval.external_reference.as_deref().unwrap_or("");
                let state_bearing =
                    matches!(status, SubscriptionStatus::Active | SubscriptionStatus::Authorized);
                match (state_bearing, PlanToken::parse(reference)) {
                    (true, Some(token)) => {
                        self.reconstruct(&mut tx, &token, Some(&preapproval.id), reference)
                            .await?
                    }
                    _ => {
                        tx.commit().await?;
                        return Ok(SyncAction::Ignored {
                            reason: "unresolvable preapproval",
                        });
                    }
                }
            }
        };

        if subscription.last_event_id.as_deref() == Some(watermark.as_str()) {
            tx.commit().await?;
            return Ok(SyncAction::Duplicate);
        }

        self.apply_subscription_status(&mut tx, &subscription, status, &watermark)
            .await?;

        let action = match status {
            SubscriptionStatus::Active | SubscriptionStatus::Authorized => {
                self.activate_tenant(&mut tx, &subscription).await?;
                self.events
                    .append(
                        &mut *tx,
                        subscription.id,
                        SubscriptionEventType::StatusChanged,
                        Some(&watermark),
                        serde_json::json!({ "status": preapproval.status }),
                    )
                    .await?;
                SyncAction::Activated {
                    tenant_id: subscription.tenant_id,
                }
            }
            SubscriptionStatus::Canceled | SubscriptionStatus::Expired => {
                self.downgrade_tenant(&mut tx, &subscription).await?;
                let event_type = if status == SubscriptionStatus::Canceled {
                    SubscriptionEventType::SubscriptionCanceled
                } else {
                    SubscriptionEventType::SubscriptionExpired
                };
                self.events
                    .append(
                        &mut *tx,
                        subscription.id,
                        event_type,
                        Some(&watermark),
                        serde_json::json!({ "status": preapproval.status }),
                    )
                    .await?;
                SyncAction::StatusChanged { status }
            }
            _ => {
                self.events
                    .append(
                        &mut *tx,
                        subscription.id,
                        SubscriptionEventType::StatusChanged,
                        Some(&watermark),
                        serde_json::json!({ "status": preapproval.status }),
                    )
                    .await?;
                SyncAction::StatusChanged { status }
            }
        };

        tx.commit().await?;
        tracing::info!(
            preapproval_id = %preapproval.id,
            subscription_id = %subscription.id,
            status = %status,
            "Subscription synced"
        );
        Ok(action)
    }

    /// One-off top-up payment: credit the wallet when approved. The wallet
    /// ledger's idempotency key is the payment id, so replays are safe.
    async fn sync_topup(
        &self,
        payment: &GatewayPayment,
        reference_rest: &str,
    ) -> BillingResult<SyncAction> {
        if payment.status != "approved" {
            tracing::debug!(
                payment_id = %payment.id,
                status = %payment.status,
                "Top-up payment not approved yet"
            );
            return Ok(SyncAction::Ignored {
                reason: "top-up not approved",
            });
        }

        // credits:<package>:est:<tenant_uuid>:<nonce>
        let parts: Vec<&str> = reference_rest.split(':').collect();
        if parts.len() != 4 || parts[1] != "est" {
            return Err(BillingError::SubscriptionUnresolvable(format!(
                "malformed top-up reference on payment {}",
                payment.id
            )));
        }
        let package_id = parts[0];
        let tenant_id = Uuid::parse_str(parts[2]).map_err(|_| {
            BillingError::SubscriptionUnresolvable(format!(
                "bad tenant id in top-up reference on payment {}",
                payment.id
            ))
        })?;

        match self.wallet.credit(tenant_id, package_id, &payment.id).await? {
            CreditOutcome::Credited { wallet } => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    payment_id = %payment.id,
                    package = %package_id,
                    extra_balance = wallet.extra_balance,
                    "Top-up payment credited"
                );
                Ok(SyncAction::TopupCredited { tenant_id })
            }
            CreditOutcome::Idempotent => Ok(SyncAction::Duplicate),
        }
    }

    /// Approved subscription payment: flip the subscription active, renew
    /// the tenant's paid window, clear any trial
    async fn apply_approval(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
        payment: &GatewayPayment,
        watermark: &str,
    ) -> BillingResult<SyncAction> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'active', last_event_id = $2,
                current_period_end = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(watermark)
        .bind(subscription.billing_cycle.advance(OffsetDateTime::now_utc()))
        .execute(&mut **tx)
        .await?;

        self.activate_tenant(tx, subscription).await?;

        self.events
            .append(
                &mut **tx,
                subscription.id,
                SubscriptionEventType::PaymentApproved,
                Some(watermark),
                serde_json::json!({
                    "amount": payment.transaction_amount,
                    "status_detail": payment.status_detail,
                }),
            )
            .await?;

        tracing::info!(
            payment_id = %payment.id,
            subscription_id = %subscription.id,
            tenant_id = %subscription.tenant_id,
            plan = %subscription.plan,
            "Payment approved, plan activated"
        );
        Ok(SyncAction::Activated {
            tenant_id: subscription.tenant_id,
        })
    }

    /// Cancel a pending checkout whose payment the gateway expired. Guarded
    /// so a stale expiry notification can never claw back an
    /// already-activated subscription.
    async fn cancel_expired_checkout(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
        watermark: &str,
    ) -> BillingResult<SyncAction> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = NOW(),
                last_event_id = $2, updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(subscription.id)
        .bind(watermark)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(SyncAction::Ignored {
                reason: "expiry after activation",
            });
        }

        self.events
            .append(
                &mut **tx,
                subscription.id,
                SubscriptionEventType::SubscriptionCanceled,
                Some(watermark),
                serde_json::json!({ "detail": "checkout payment expired unpaid" }),
            )
            .await?;
        Ok(SyncAction::StatusChanged {
            status: SubscriptionStatus::Canceled,
        })
    }

    async fn apply_subscription_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
        status: SubscriptionStatus,
        watermark: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = $2, last_event_id = $3,
                canceled_at = CASE WHEN $2 = 'canceled' THEN NOW() ELSE canceled_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.id)
        .bind(status)
        .bind(watermark)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Project the paid plan onto the tenant row. The new paid window is
    /// anchored at whichever is later, now or the current window's end, so
    /// early renewals extend rather than truncate.
    async fn activate_tenant(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let current_until: Option<Option<OffsetDateTime>> =
            sqlx::query_scalar("SELECT plan_active_until FROM tenants WHERE id = $1")
                .bind(subscription.tenant_id)
                .fetch_optional(&mut **tx)
                .await?;
        let current_until = current_until
            .ok_or_else(|| BillingError::TenantNotFound(subscription.tenant_id.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let anchor = current_until.filter(|until| *until > now).unwrap_or(now);
        let active_until = subscription.billing_cycle.advance(anchor);

        sqlx::query(
            r#"
            UPDATE tenants
            SET plan = $2, plan_status = 'active', plan_cycle = $3,
                plan_active_until = $4, plan_trial_ends_at = NULL,
                plan_subscription_id = $5, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(subscription.tenant_id)
        .bind(subscription.plan)
        .bind(subscription.billing_cycle)
        .bind(active_until)
        .bind(subscription.id)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Deactivate the tenant's plan, but only while this subscription is
    /// still the one projected onto the tenant. A newer subscription's
    /// activation wins over a stale cancellation.
    async fn downgrade_tenant(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        subscription: &Subscription,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET plan_status = 'inactive', updated_at = NOW()
            WHERE id = $1 AND plan_subscription_id = $2
            "#,
        )
        .bind(subscription.tenant_id)
        .bind(subscription.id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            tracing::info!(
                tenant_id = %subscription.tenant_id,
                subscription_id = %subscription.id,
                "Cancellation skipped, tenant moved to a newer subscription"
            );
        }
        Ok(())
    }

    /// Correlate a payment to its subscription row: preference id first,
    /// then external reference, then token reconstruction for rows the
    /// database no longer has
    async fn resolve_subscription(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &GatewayPayment,
    ) -> BillingResult<Option<Subscription>> {
        if let Some(preference_id) = payment.preference_id.as_deref() {
            let found: Option<Subscription> = sqlx::query_as(
                "SELECT * FROM subscriptions WHERE gateway_preference_id = $1 FOR UPDATE",
            )
            .bind(preference_id)
            .fetch_optional(&mut **tx)
            .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        let Some(reference) = payment.external_reference.as_deref() else {
            return Ok(None);
        };

        let found: Option<Subscription> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE external_reference = $1 FOR UPDATE")
                .bind(reference)
                .fetch_optional(&mut **tx)
                .await?;
        if found.is_some() {
            return Ok(found);
        }

        // Reconstruct only when the payment carries state worth keeping
        if payment.status != "approved" {
            return Ok(None);
        }
        match PlanToken::parse(reference) {
            Some(token) => Ok(Some(self.reconstruct(tx, &token, None, reference).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_gateway_subscription(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        preapproval_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let found = sqlx::query_as(
            "SELECT * FROM subscriptions WHERE gateway_subscription_id = $1 FOR UPDATE",
        )
        .bind(preapproval_id)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(found)
    }

    /// Rebuild a subscription row from its checkout token. The gateway
    /// kept the money; we lost the row. The reconstructed row starts at
    /// `initiated` and the caller's status application converges it.
    async fn reconstruct(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        token: &PlanToken,
        gateway_subscription_id: Option<&str>,
        reference: &str,
    ) -> BillingResult<Subscription> {
        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (tenant_id, plan, billing_cycle, status, amount_cents, currency,
                 gateway_subscription_id, external_reference)
            VALUES ($1, $2, $3, 'initiated', $4, 'BRL', $5, $6)
            ON CONFLICT (external_reference) DO UPDATE SET updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(token.tenant_id)
        .bind(token.plan)
        .bind(token.cycle)
        .bind(token.plan.price_cents(token.cycle))
        .bind(gateway_subscription_id)
        .bind(reference)
        .fetch_one(&mut **tx)
        .await?;

        self.events
            .append(
                &mut **tx,
                subscription.id,
                SubscriptionEventType::Reconstructed,
                None,
                serde_json::json!({ "external_reference": reference }),
            )
            .await?;

        tracing::warn!(
            subscription_id = %subscription.id,
            tenant_id = %token.tenant_id,
            "Subscription row reconstructed from checkout token"
        );
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn test_map_status_table() {
        assert_eq!(map_status("authorized"), Some(SubscriptionStatus::Authorized));
        assert_eq!(map_status("active"), Some(SubscriptionStatus::Active));
        assert_eq!(map_status("approved"), Some(SubscriptionStatus::Active));
        assert_eq!(map_status("paused"), Some(SubscriptionStatus::Paused));
        assert_eq!(map_status("halted"), Some(SubscriptionStatus::Paused));
        assert_eq!(map_status("cancelled"), Some(SubscriptionStatus::Canceled));
        assert_eq!(map_status("canceled"), Some(SubscriptionStatus::Canceled));
        assert_eq!(map_status("expired"), Some(SubscriptionStatus::Expired));
        assert_eq!(map_status("finished"), Some(SubscriptionStatus::Expired));
        assert_eq!(map_status("pending"), Some(SubscriptionStatus::Pending));
        assert_eq!(map_status("in_process"), Some(SubscriptionStatus::Pending));
        assert_eq!(map_status("inprocess"), Some(SubscriptionStatus::Pending));
        assert_eq!(map_status("charged_back"), Some(SubscriptionStatus::PastDue));
        assert_eq!(map_status("rejected"), Some(SubscriptionStatus::PastDue));
        assert_eq!(map_status("something_new"), None);
        assert_eq!(map_status(""), None);
    }

    #[test]
    fn test_payment_watermark_distinguishes_lifecycle_stages() {
        // One payment id covers the whole lifecycle; each mapped status
        // must produce its own watermark
        assert_eq!(payment_watermark("123", "pending"), "123:pending");
        assert_eq!(payment_watermark("123", "in_process"), "123:pending");
        assert_eq!(payment_watermark("123", "approved"), "123:active");
        assert_eq!(payment_watermark("123", "rejected"), "123:past_due");
        assert_ne!(
            payment_watermark("123", "pending"),
            payment_watermark("123", "approved")
        );
        // Unmapped statuses never reach the write path; fall back to the id
        assert_eq!(payment_watermark("123", "refunded"), "123");
    }

    #[test]
    fn test_plan_token_round_trip() {
        let token = PlanToken::mint(Plan::Pro, BillingCycle::Monthly, Uuid::new_v4());
        let encoded = token.encode();
        assert!(encoded.starts_with("plan:pro:cycle:mensal:est:"));
        assert_eq!(PlanToken::parse(&encoded).unwrap(), token);
    }

    #[test]
    fn test_plan_token_yearly_segment() {
        let token = PlanToken::mint(Plan::Premium, BillingCycle::Yearly, Uuid::new_v4());
        assert!(token.encode().contains(":cycle:anual:"));
    }

    #[test]
    fn test_plan_token_rejects_malformed() {
        assert!(PlanToken::parse("").is_none());
        assert!(PlanToken::parse("credits:msg100:est:x:y").is_none());
        assert!(PlanToken::parse("plan:gold:cycle:mensal:est:uuid:n").is_none());
        assert!(PlanToken::parse("plan:pro:cycle:weekly:est:uuid:n").is_none());
        let id = Uuid::new_v4();
        // missing nonce
        assert!(PlanToken::parse(&format!("plan:pro:cycle:mensal:est:{}:", id)).is_none());
        // wrong marker
        assert!(PlanToken::parse(&format!("plan:pro:ciclo:mensal:est:{}:n", id)).is_none());
    }
}
