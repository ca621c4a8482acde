#!/usr/bin/env rust-script
//! Wallet Ledger Consistency Verification
//!
//! Detects drift between wallet balances and the ledger, and between
//! tenant plan state and subscriptions, for the Agendou billing system.
//!
//! ## Usage
//! ```bash
//! cargo run --bin verify_ledger_consistency
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//!
//! ## Checks
//! 1. Wallet balances equal the sum of their ledger deltas
//! 2. No wallet holds more included balance than its limit
//! 3. Duplicate idempotency keys (should be impossible)
//! 4. Active tenants point at an existing, active subscription
//! 5. Stuck checkouts (initiated/pending older than 24h)

use std::env;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Agendou Wallet Ledger Verification");
    println!("====================================\n");

    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;
    println!("✓ Connected to database\n");

    let mut issues = 0usize;

    // ========================================================================
    // Check 1: Ledger sums match live balances
    // ========================================================================
    println!("Check 1: Verifying ledger sums match wallet balances...");

    let drifted: Vec<(uuid::Uuid, i32, i64, i32, i64)> = sqlx::query_as(
        r#"
        SELECT w.tenant_id,
               w.included_balance,
               COALESCE(SUM(t.included_delta), 0)::BIGINT,
               w.extra_balance,
               COALESCE(SUM(t.extra_delta), 0)::BIGINT
        FROM wallets w
        LEFT JOIN wallet_transactions t ON t.tenant_id = w.tenant_id
        GROUP BY w.tenant_id, w.included_balance, w.extra_balance
        HAVING w.included_balance != COALESCE(SUM(t.included_delta), 0)
            OR w.extra_balance != COALESCE(SUM(t.extra_delta), 0)
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if drifted.is_empty() {
        println!("  ✓ All wallet balances match their ledger");
    } else {
        issues += drifted.len();
        println!("  ⚠ Found {} wallets out of sync with their ledger", drifted.len());
        for (tenant_id, included, included_sum, extra, extra_sum) in &drifted {
            println!(
                "    - {}: included {} vs ledger {}, extra {} vs ledger {}",
                tenant_id, included, included_sum, extra, extra_sum
            );
        }
    }

    // ========================================================================
    // Check 2: Balance within limit
    // ========================================================================
    println!("\nCheck 2: Verifying included balances stay within limits...");

    let over_limit: Vec<(uuid::Uuid, i32, i32)> = sqlx::query_as(
        "SELECT tenant_id, included_balance, included_limit FROM wallets WHERE included_balance > included_limit",
    )
    .fetch_all(&pool)
    .await?;

    if over_limit.is_empty() {
        println!("  ✓ No wallet exceeds its included limit");
    } else {
        issues += over_limit.len();
        println!("  ⚠ Found {} wallets above their included limit", over_limit.len());
        for (tenant_id, balance, limit) in &over_limit {
            println!("    - {}: balance {} > limit {}", tenant_id, balance, limit);
        }
    }

    // ========================================================================
    // Check 3: Duplicate idempotency keys
    // ========================================================================
    println!("\nCheck 3: Verifying idempotency keys are unique...");

    let duplicates: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT idempotency_key, COUNT(*)
        FROM wallet_transactions
        WHERE idempotency_key IS NOT NULL
        GROUP BY idempotency_key
        HAVING COUNT(*) > 1
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if duplicates.is_empty() {
        println!("  ✓ No duplicate idempotency keys");
    } else {
        issues += duplicates.len();
        println!("  ⚠ Found {} duplicated idempotency keys (index damaged?)", duplicates.len());
        for (key, count) in &duplicates {
            println!("    - {} appears {} times", key, count);
        }
    }

    // ========================================================================
    // Check 4: Active tenants reference a live subscription
    // ========================================================================
    println!("\nCheck 4: Verifying active tenants have an active subscription...");

    let orphaned: Vec<(uuid::Uuid, String)> = sqlx::query_as(
        r#"
        SELECT t.id, t.name
        FROM tenants t
        LEFT JOIN subscriptions s ON s.id = t.plan_subscription_id
        WHERE t.plan_status = 'active'
          AND t.plan_subscription_id IS NOT NULL
          AND (s.id IS NULL OR s.status NOT IN ('authorized', 'active'))
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if orphaned.is_empty() {
        println!("  ✓ All active tenants reference a live subscription");
    } else {
        issues += orphaned.len();
        println!("  ⚠ Found {} active tenants with a dead subscription", orphaned.len());
        for (tenant_id, name) in &orphaned {
            println!("    - {}: {}", tenant_id, name);
        }
    }

    // ========================================================================
    // Check 5: Stuck checkouts
    // ========================================================================
    println!("\nCheck 5: Looking for checkouts stuck over 24 hours...");

    let stuck: Vec<(uuid::Uuid, String)> = sqlx::query_as(
        r#"
        SELECT id, status::TEXT
        FROM subscriptions
        WHERE status IN ('initiated', 'pending')
          AND created_at < NOW() - INTERVAL '24 hours'
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if stuck.is_empty() {
        println!("  ✓ No stuck checkouts");
    } else {
        println!("  ⚠ Found {} stuck checkouts (run reconcile_subscriptions)", stuck.len());
        for (id, status) in &stuck {
            println!("    - {} ({})", id, status);
        }
    }

    println!("\n====================================");
    if issues == 0 {
        println!("Ledger is consistent.");
    } else {
        println!("{} consistency issues found.", issues);
        std::process::exit(1);
    }
    Ok(())
}
