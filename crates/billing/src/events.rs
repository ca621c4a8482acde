//! Append-only subscription audit trail
//!
//! Every state-changing gateway interaction writes one row here, inside
//! the same transaction as the state change itself. The trail is what
//! support reads when a tenant disputes a charge or a subscription looks
//! stuck.

use agendou_shared::SubscriptionEvent;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Well-known audit event types, stored as their SCREAMING_SNAKE name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventType {
    CheckoutInitiated,
    PaymentApproved,
    PaymentRejected,
    StatusChanged,
    SubscriptionCanceled,
    SubscriptionExpired,
    TopupCredited,
    Reconstructed,
}

impl std::fmt::Display for SubscriptionEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CheckoutInitiated => "CHECKOUT_INITIATED",
            Self::PaymentApproved => "PAYMENT_APPROVED",
            Self::PaymentRejected => "PAYMENT_REJECTED",
            Self::StatusChanged => "STATUS_CHANGED",
            Self::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            Self::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            Self::TopupCredited => "TOPUP_CREDITED",
            Self::Reconstructed => "RECONSTRUCTED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Clone)]
pub struct SubscriptionEventLogger {
    pool: PgPool,
}

impl SubscriptionEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an audit row. Executor-generic so callers can pass the
    /// transaction that carries the state change being audited.
    pub async fn append<'e, E>(
        &self,
        executor: E,
        subscription_id: Uuid,
        event_type: SubscriptionEventType,
        gateway_event_id: Option<&str>,
        raw_payload: serde_json::Value,
    ) -> BillingResult<()>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO subscription_events (subscription_id, event_type, gateway_event_id, raw_payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(subscription_id)
        .bind(event_type.to_string())
        .bind(gateway_event_id)
        .bind(raw_payload)
        .execute(executor)
        .await?;

        tracing::debug!(
            subscription_id = %subscription_id,
            event_type = %event_type,
            "Subscription event appended"
        );
        Ok(())
    }

    /// Most recent events for a subscription, newest first
    pub async fn recent(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<SubscriptionEvent>> {
        let events = sqlx::query_as(
            r#"
            SELECT * FROM subscription_events
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(subscription_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names_are_stable() {
        assert_eq!(
            SubscriptionEventType::CheckoutInitiated.to_string(),
            "CHECKOUT_INITIATED"
        );
        assert_eq!(
            SubscriptionEventType::TopupCredited.to_string(),
            "TOPUP_CREDITED"
        );
        assert_eq!(SubscriptionEventType::Reconstructed.to_string(), "RECONSTRUCTED");
    }
}
