//! Integration tests for payment reconciliation and dunning
//!
//! These run against a real Postgres with migrations applied; the gateway
//! is stood in for by a mockito server:
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/agendou_test"
//! cargo test --test gateway_sync -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agendou_billing::{
    BillingResult, DunningConfig, DunningMonitor, GatewayClient, GatewayConfig, MessageTransport,
    OutboundMessage, PaymentSynchronizer, SubscriptionEventLogger, SubscriptionEventType,
    SyncAction, WalletService,
};
use agendou_billing::sync::PlanToken;
use agendou_shared::{BillingCycle, Plan, SubscriptionStatus};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

async fn connect() -> PgPool {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database")
}

fn synchronizer(pool: &PgPool, gateway_base_url: String) -> PaymentSynchronizer {
    let gateway = GatewayClient::new(GatewayConfig {
        access_token: "TEST-token".to_string(),
        base_url: gateway_base_url,
        app_base_url: "http://localhost:3000".to_string(),
        notification_url: "http://localhost:3000/webhooks/mercadopago".to_string(),
        currency: "BRL".to_string(),
        request_timeout_secs: 5,
    })
    .unwrap();
    PaymentSynchronizer::new(
        pool.clone(),
        gateway,
        WalletService::new(pool.clone()),
        SubscriptionEventLogger::new(pool.clone()),
    )
}

async fn create_test_tenant(pool: &PgPool, plan_status: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO tenants
            (id, name, email, plan, plan_status, notify_email, notify_whatsapp, whatsapp_enabled)
        VALUES ($1, $2, $3, 'essencial', $4, true, false, true)
        "#,
    )
    .bind(id)
    .bind(format!("Estabelecimento {}", &id.to_string()[..8]))
    .bind(format!("test-{}@example.com", &id.to_string()[..8]))
    .bind(plan_status)
    .execute(pool)
    .await
    .expect("Failed to insert test tenant");
    id
}

/// Insert a checkout-time subscription row and return (id, external_reference)
async fn create_pending_subscription(pool: &PgPool, tenant_id: Uuid, plan: Plan) -> (Uuid, String) {
    let token = PlanToken::mint(plan, BillingCycle::Monthly, tenant_id);
    let reference = token.encode();
    let (id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO subscriptions
            (tenant_id, plan, billing_cycle, status, amount_cents, external_reference)
        VALUES ($1, $2, $3, 'pending', $4, $5)
        RETURNING id
        "#,
    )
    .bind(tenant_id)
    .bind(plan)
    .bind(BillingCycle::Monthly)
    .bind(plan.price_cents(BillingCycle::Monthly))
    .bind(&reference)
    .fetch_one(pool)
    .await
    .expect("Failed to insert test subscription");
    (id, reference)
}

async fn event_count(pool: &PgPool, subscription_id: Uuid, event_type: SubscriptionEventType) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM subscription_events WHERE subscription_id = $1 AND event_type = $2",
    )
    .bind(subscription_id)
    .bind(event_type.to_string())
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore]
async fn test_approved_payment_replay_activates_once() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "trialing").await;
    let (subscription_id, reference) = create_pending_subscription(&pool, tenant, Plan::Pro).await;

    let payment_id = format!("{}", 100_000 + rand_suffix());
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", format!("/v1/payments/{payment_id}").as_str())
        .with_status(200)
        .with_body(format!(
            r#"{{"id": {payment_id}, "status": "approved", "status_detail": "accredited",
                "external_reference": "{reference}", "transaction_amount": 99.90}}"#,
        ))
        .expect(2)
        .create_async()
        .await;

    let sync = synchronizer(&pool, server.url());
    let first = sync.sync_payment(&payment_id).await.unwrap();
    assert_eq!(first, SyncAction::Activated { tenant_id: tenant });

    let replay = sync.sync_payment(&payment_id).await.unwrap();
    assert_eq!(replay, SyncAction::Duplicate);
    mock.assert_async().await;

    let (status, last_event_id): (String, Option<String>) =
        sqlx::query_as("SELECT status, last_event_id FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "active");
    assert_eq!(
        last_event_id,
        Some(format!("{payment_id}:active")),
        "watermark should fold the mapped status in"
    );

    // One activation, one audit row
    assert_eq!(
        event_count(&pool, subscription_id, SubscriptionEventType::PaymentApproved).await,
        1
    );

    let (plan_status, active_until): (String, Option<OffsetDateTime>) =
        sqlx::query_as("SELECT plan_status, plan_active_until FROM tenants WHERE id = $1")
            .bind(tenant)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(plan_status, "active");
    let active_until = active_until.unwrap();
    let now = OffsetDateTime::now_utc();
    assert!(active_until > now + Duration::days(27));
    assert!(active_until < now + Duration::days(32));
}

#[tokio::test]
#[ignore]
async fn test_pending_then_approved_payment_activates() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "trialing").await;
    let (subscription_id, reference) = create_pending_subscription(&pool, tenant, Plan::Pro).await;

    // The gateway reports the same payment id first as pending, then as
    // approved; the pending notification must not swallow the approval
    let payment_id = format!("{}", 400_000 + rand_suffix());
    let mut server = mockito::Server::new_async().await;
    let pending_mock = server
        .mock("GET", format!("/v1/payments/{payment_id}").as_str())
        .with_status(200)
        .with_body(format!(
            r#"{{"id": "{payment_id}", "status": "pending",
                "external_reference": "{reference}"}}"#,
        ))
        .expect(1)
        .create_async()
        .await;

    let sync = synchronizer(&pool, server.url());
    let first = sync.sync_payment(&payment_id).await.unwrap();
    assert_eq!(
        first,
        SyncAction::StatusChanged {
            status: SubscriptionStatus::Pending
        }
    );
    pending_mock.assert_async().await;

    // Later-created mocks take matching precedence
    server
        .mock("GET", format!("/v1/payments/{payment_id}").as_str())
        .with_status(200)
        .with_body(format!(
            r#"{{"id": "{payment_id}", "status": "approved", "status_detail": "accredited",
                "external_reference": "{reference}", "transaction_amount": 99.90}}"#,
        ))
        .create_async()
        .await;

    let second = sync.sync_payment(&payment_id).await.unwrap();
    assert_eq!(second, SyncAction::Activated { tenant_id: tenant });

    let (status,): (String,) = sqlx::query_as("SELECT status FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "active");
    let (plan_status,): (String,) =
        sqlx::query_as("SELECT plan_status FROM tenants WHERE id = $1")
            .bind(tenant)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(plan_status, "active");
    assert_eq!(
        event_count(&pool, subscription_id, SubscriptionEventType::PaymentApproved).await,
        1
    );
}

#[tokio::test]
#[ignore]
async fn test_lost_checkout_row_reconstructed_from_token() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "trialing").await;
    // No subscription row: the checkout write was lost, only the token
    // embedded in the gateway payment survives
    let reference = PlanToken::mint(Plan::Pro, BillingCycle::Monthly, tenant).encode();

    let payment_id = format!("{}", 200_000 + rand_suffix());
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", format!("/v1/payments/{payment_id}").as_str())
        .with_status(200)
        .with_body(format!(
            r#"{{"id": "{payment_id}", "status": "approved",
                "external_reference": "{reference}", "transaction_amount": 99.90}}"#,
        ))
        .create_async()
        .await;

    let sync = synchronizer(&pool, server.url());
    let action = sync.sync_payment(&payment_id).await.unwrap();
    assert_eq!(action, SyncAction::Activated { tenant_id: tenant });

    let (subscription_id, plan, status): (Uuid, String, String) = sqlx::query_as(
        "SELECT id, plan, status FROM subscriptions WHERE external_reference = $1",
    )
    .bind(&reference)
    .fetch_one(&pool)
    .await
    .expect("subscription row should have been reconstructed");
    assert_eq!(plan, "pro");
    assert_eq!(status, "active");
    assert_eq!(
        event_count(&pool, subscription_id, SubscriptionEventType::Reconstructed).await,
        1
    );

    let (tenant_plan, plan_status): (String, String) =
        sqlx::query_as("SELECT plan, plan_status FROM tenants WHERE id = $1")
            .bind(tenant)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(tenant_plan, "pro");
    assert_eq!(plan_status, "active");
}

#[tokio::test]
#[ignore]
async fn test_expired_checkout_cancels_pending_only() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "trialing").await;
    let (subscription_id, reference) =
        create_pending_subscription(&pool, tenant, Plan::Essencial).await;

    let payment_id = format!("{}", 300_000 + rand_suffix());
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", format!("/v1/payments/{payment_id}").as_str())
        .with_status(200)
        .with_body(format!(
            r#"{{"id": "{payment_id}", "status": "cancelled", "status_detail": "expired",
                "external_reference": "{reference}"}}"#,
        ))
        .expect(2)
        .create_async()
        .await;

    let sync = synchronizer(&pool, server.url());
    let action = sync.sync_payment(&payment_id).await.unwrap();
    assert_eq!(
        action,
        SyncAction::StatusChanged {
            status: SubscriptionStatus::Canceled
        }
    );

    let (status, canceled_at): (String, Option<OffsetDateTime>) =
        sqlx::query_as("SELECT status, canceled_at FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "canceled");
    assert!(canceled_at.is_some());

    // A stale expiry must never claw back a subscription that has since
    // activated
    sqlx::query("UPDATE subscriptions SET status = 'active', last_event_id = NULL WHERE id = $1")
        .bind(subscription_id)
        .execute(&pool)
        .await
        .unwrap();
    let replay = sync.sync_payment(&payment_id).await.unwrap();
    assert!(matches!(replay, SyncAction::Ignored { .. }));
    let (status,): (String,) = sqlx::query_as("SELECT status FROM subscriptions WHERE id = $1")
        .bind(subscription_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "active");
}

/// Transport fake that records every message and delivers per the flag
#[derive(Clone)]
struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    deliver: Arc<AtomicBool>,
}

impl RecordingTransport {
    fn new(deliver: bool) -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            deliver: Arc::new(AtomicBool::new(deliver)),
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl MessageTransport for RecordingTransport {
    async fn send(&self, message: &OutboundMessage) -> BillingResult<bool> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(self.deliver.load(Ordering::SeqCst))
    }
}

async fn set_paid_window(pool: &PgPool, tenant: Uuid, active_until: OffsetDateTime) {
    sqlx::query("UPDATE tenants SET plan_active_until = $2 WHERE id = $1")
        .bind(tenant)
        .bind(active_until)
        .execute(pool)
        .await
        .unwrap();
}

async fn mark_statuses(pool: &PgPool, tenant: Uuid) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT status FROM reminder_marks WHERE tenant_id = $1 ORDER BY created_at",
    )
    .bind(tenant)
    .fetch_all(pool)
    .await
    .unwrap()
}

#[tokio::test]
#[ignore]
async fn test_due_soon_reminder_fires_once_per_due_date() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "active").await;
    set_paid_window(&pool, tenant, OffsetDateTime::now_utc() + Duration::days(2)).await;

    let transport = RecordingTransport::new(true);
    let monitor = DunningMonitor::new(pool.clone(), transport.clone(), DunningConfig::default());

    monitor.tick().await.unwrap();
    monitor.tick().await.unwrap();

    assert_eq!(transport.sent_count(), 1);
    assert_eq!(mark_statuses(&pool, tenant).await, vec!["sent".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_failed_send_releases_mark_for_retry() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "active").await;
    set_paid_window(&pool, tenant, OffsetDateTime::now_utc() + Duration::days(2)).await;

    let transport = RecordingTransport::new(false);
    let monitor = DunningMonitor::new(pool.clone(), transport.clone(), DunningConfig::default());

    monitor.tick().await.unwrap();
    assert_eq!(transport.sent_count(), 1);
    assert_eq!(
        mark_statuses(&pool, tenant).await,
        vec!["released".to_string()]
    );

    // Dispatcher back up: the released mark no longer blocks the fence
    transport.deliver.store(true, Ordering::SeqCst);
    monitor.tick().await.unwrap();
    assert_eq!(transport.sent_count(), 2);
    assert_eq!(
        mark_statuses(&pool, tenant).await,
        vec!["released".to_string(), "sent".to_string()]
    );
}

#[tokio::test]
#[ignore]
async fn test_exhausted_grace_suspends_once() {
    let pool = connect().await;
    let tenant = create_test_tenant(&pool, "active").await;
    set_paid_window(&pool, tenant, OffsetDateTime::now_utc() - Duration::days(20)).await;

    let transport = RecordingTransport::new(true);
    let monitor = DunningMonitor::new(pool.clone(), transport.clone(), DunningConfig::default());

    monitor.tick().await.unwrap();

    let (plan_status,): (String,) =
        sqlx::query_as("SELECT plan_status FROM tenants WHERE id = $1")
            .bind(tenant)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(plan_status, "delinquent");
    assert_eq!(transport.sent_count(), 1);

    // Delinquent tenants drop out of the sweep entirely
    monitor.tick().await.unwrap();
    assert_eq!(transport.sent_count(), 1);
}

fn rand_suffix() -> u32 {
    u32::from(Uuid::new_v4().as_bytes()[0]) * 256 + u32::from(Uuid::new_v4().as_bytes()[1])
}
