//! Integration tests for the wallet ledger invariants
//!
//! These run against a real Postgres with migrations applied:
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/agendou_test"
//! cargo test --test wallet_ledger -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use agendou_billing::{CreditOutcome, DebitOutcome, WalletService};
use agendou_shared::{BlockReason, DebitBucket};
use sqlx::PgPool;
use uuid::Uuid;

async fn setup() -> (WalletService, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    (WalletService::new(pool.clone()), pool)
}

/// Insert an active tenant on the given plan and return its id
async fn create_test_tenant(pool: &PgPool, plan: &str) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO tenants
            (id, name, email, plan, plan_status, notify_email, notify_whatsapp, whatsapp_enabled)
        VALUES ($1, $2, $3, $4, 'active', true, false, true)
        "#,
    )
    .bind(id)
    .bind(format!("Estabelecimento {}", &id.to_string()[..8]))
    .bind(format!("test-{}@example.com", &id.to_string()[..8]))
    .bind(plan)
    .execute(pool)
    .await
    .expect("Failed to insert test tenant");
    id
}

async fn ledger_sums(pool: &PgPool, tenant_id: Uuid) -> (i64, i64) {
    sqlx::query_as(
        r#"
        SELECT COALESCE(SUM(included_delta), 0)::BIGINT,
               COALESCE(SUM(extra_delta), 0)::BIGINT
        FROM wallet_transactions WHERE tenant_id = $1
        "#,
    )
    .bind(tenant_id)
    .fetch_one(pool)
    .await
    .expect("Failed to sum ledger")
}

#[tokio::test]
#[ignore]
async fn test_debit_replay_is_idempotent() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "essencial").await;
    let message_id = format!("wamid-{}", Uuid::new_v4());

    let first = wallet.debit(tenant, &message_id, None).await.unwrap();
    assert!(matches!(
        first,
        DebitOutcome::Debited {
            bucket: DebitBucket::Included,
            ..
        }
    ));

    let replay = wallet.debit(tenant, &message_id, None).await.unwrap();
    assert!(matches!(replay, DebitOutcome::Idempotent));

    let snapshot = wallet.snapshot(tenant).await.unwrap();
    assert_eq!(snapshot.included_balance, snapshot.included_limit - 1);
}

#[tokio::test]
#[ignore]
async fn test_debit_drains_included_before_extra() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "essencial").await;

    // Provision, then force the included bucket empty and grant extra
    wallet.snapshot(tenant).await.unwrap();
    sqlx::query("UPDATE wallets SET included_balance = 0, extra_balance = 5 WHERE tenant_id = $1")
        .bind(tenant)
        .execute(&pool)
        .await
        .unwrap();

    let outcome = wallet
        .debit(tenant, &format!("wamid-{}", Uuid::new_v4()), None)
        .await
        .unwrap();
    match outcome {
        DebitOutcome::Debited { bucket, wallet } => {
            assert_eq!(bucket, DebitBucket::Extra);
            assert_eq!(wallet.extra_balance, 4);
            assert_eq!(wallet.included_balance, 0);
        }
        other => panic!("expected extra-bucket debit, got {:?}", other),
    }
}

#[tokio::test]
#[ignore]
async fn test_empty_wallet_blocks_and_key_is_burned() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "essencial").await;

    wallet.snapshot(tenant).await.unwrap();
    sqlx::query("UPDATE wallets SET included_balance = 0, extra_balance = 0 WHERE tenant_id = $1")
        .bind(tenant)
        .execute(&pool)
        .await
        .unwrap();

    let message_id = format!("wamid-{}", Uuid::new_v4());
    let blocked = wallet.debit(tenant, &message_id, None).await.unwrap();
    assert!(matches!(
        blocked,
        DebitOutcome::Blocked {
            reason: BlockReason::InsufficientBalance
        }
    ));

    // Replaying the same message id after a top-up must not debit: the
    // blocked row already holds the idempotency key
    sqlx::query("UPDATE wallets SET extra_balance = 10 WHERE tenant_id = $1")
        .bind(tenant)
        .execute(&pool)
        .await
        .unwrap();
    let replay = wallet.debit(tenant, &message_id, None).await.unwrap();
    assert!(matches!(replay, DebitOutcome::Idempotent));

    let snapshot = wallet.snapshot(tenant).await.unwrap();
    assert_eq!(snapshot.extra_balance, 10);
}

#[tokio::test]
#[ignore]
async fn test_per_appointment_cap_blocks_sixth_message() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "pro").await;
    let appointment = Uuid::new_v4();

    for _ in 0..5 {
        let outcome = wallet
            .debit(tenant, &format!("wamid-{}", Uuid::new_v4()), Some(appointment))
            .await
            .unwrap();
        assert!(matches!(outcome, DebitOutcome::Debited { .. }));
    }

    let sixth = wallet
        .debit(tenant, &format!("wamid-{}", Uuid::new_v4()), Some(appointment))
        .await
        .unwrap();
    assert!(matches!(
        sixth,
        DebitOutcome::Blocked {
            reason: BlockReason::PerAppointmentLimit
        }
    ));

    // A different appointment is unaffected
    let other = wallet
        .debit(tenant, &format!("wamid-{}", Uuid::new_v4()), Some(Uuid::new_v4()))
        .await
        .unwrap();
    assert!(matches!(other, DebitOutcome::Debited { .. }));
}

#[tokio::test]
#[ignore]
async fn test_topup_credit_is_idempotent_by_payment_id() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "essencial").await;
    let payment_id = format!("pay-{}", Uuid::new_v4());

    let first = wallet.credit(tenant, "msg100", &payment_id).await.unwrap();
    match first {
        CreditOutcome::Credited { wallet } => assert_eq!(wallet.extra_balance, 100),
        other => panic!("expected credit, got {:?}", other),
    }

    let replay = wallet.credit(tenant, "msg100", &payment_id).await.unwrap();
    assert!(matches!(replay, CreditOutcome::Idempotent));

    let snapshot = wallet.snapshot(tenant).await.unwrap();
    assert_eq!(snapshot.extra_balance, 100);
}

#[tokio::test]
#[ignore]
async fn test_cycle_rollover_resets_included_once() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "essencial").await;

    wallet.snapshot(tenant).await.unwrap();
    // Age the window into last month with some usage and extra credits
    sqlx::query(
        r#"
        UPDATE wallets
        SET cycle_start = cycle_start - INTERVAL '1 month',
            cycle_end = cycle_end - INTERVAL '1 month',
            included_balance = 40, extra_balance = 7
        WHERE tenant_id = $1
        "#,
    )
    .bind(tenant)
    .execute(&pool)
    .await
    .unwrap();

    let snapshot = wallet.snapshot(tenant).await.unwrap();
    assert_eq!(snapshot.included_balance, 250);
    assert_eq!(snapshot.extra_balance, 7);

    // A second read must not roll again
    let again = wallet.snapshot(tenant).await.unwrap();
    assert_eq!(again.included_balance, 250);

    let rollovers: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM wallet_transactions
        WHERE tenant_id = $1 AND kind = 'cycle_reset'
          AND metadata->>'reason' = 'rollover'
        "#,
    )
    .bind(tenant)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(rollovers, 1);
}

#[tokio::test]
#[ignore]
async fn test_limit_change_preserves_cycle_usage() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "pro").await;

    // 1400 of 1500 used this cycle
    wallet.snapshot(tenant).await.unwrap();
    sqlx::query("UPDATE wallets SET included_balance = 100 WHERE tenant_id = $1")
        .bind(tenant)
        .execute(&pool)
        .await
        .unwrap();

    // Downgrade mid-cycle; usage exceeds the new allotment entirely
    sqlx::query("UPDATE tenants SET plan = 'essencial' WHERE id = $1")
        .bind(tenant)
        .execute(&pool)
        .await
        .unwrap();

    let snapshot = wallet.snapshot(tenant).await.unwrap();
    assert_eq!(snapshot.included_limit, 250);
    assert_eq!(snapshot.included_balance, 0);
}

#[tokio::test]
#[ignore]
async fn test_ledger_sums_match_balances() {
    let (wallet, pool) = setup().await;
    let tenant = create_test_tenant(&pool, "essencial").await;

    wallet.credit(tenant, "msg500", &format!("pay-{}", Uuid::new_v4())).await.unwrap();
    for _ in 0..3 {
        wallet
            .debit(tenant, &format!("wamid-{}", Uuid::new_v4()), None)
            .await
            .unwrap();
    }

    let snapshot = wallet.snapshot(tenant).await.unwrap();
    let (included_sum, extra_sum) = ledger_sums(&pool, tenant).await;
    assert_eq!(included_sum, i64::from(snapshot.included_balance));
    assert_eq!(extra_sum, i64::from(snapshot.extra_balance));
}
