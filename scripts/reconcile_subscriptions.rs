#!/usr/bin/env rust-script
//! Subscription Reconciliation
//!
//! Re-syncs stale local subscription rows with the payment gateway. The
//! gateway is the source of truth: any subscription that has sat in
//! 'initiated' or 'pending' with a known gateway id gets refetched and its
//! local status corrected.
//!
//! ## Usage
//! ```bash
//! # Dry run (default) - shows what would be re-synced
//! cargo run --bin reconcile_subscriptions
//!
//! # Apply the sync
//! cargo run --bin reconcile_subscriptions -- --apply
//! ```
//!
//! ## Environment Variables
//! - DATABASE_URL: PostgreSQL connection string
//! - MP_ACCESS_TOKEN: Mercado Pago access token
//! - MP_BASE_URL: Gateway base URL (optional, defaults to production)

use std::env;
use std::error::Error;

use agendou_billing::{
    GatewayClient, PaymentSynchronizer, SubscriptionEventLogger, SyncAction, WalletService,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();
    let apply = args.contains(&"--apply".to_string());

    println!("Agendou Subscription Reconciliation");
    println!("=====================================");
    if apply {
        println!("Mode: APPLY (local rows will be updated)\n");
    } else {
        println!("Mode: DRY RUN (pass --apply to update)\n");
    }

    dotenvy::dotenv().ok();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = sqlx::postgres::PgPool::connect(&database_url).await?;
    println!("✓ Connected to database");

    let gateway = GatewayClient::from_env()?;
    println!("✓ Gateway client configured\n");

    let stale: Vec<(uuid::Uuid, String, String)> = sqlx::query_as(
        r#"
        SELECT id, gateway_subscription_id, status::TEXT
        FROM subscriptions
        WHERE status IN ('initiated', 'pending')
          AND gateway_subscription_id IS NOT NULL
          AND updated_at < NOW() - INTERVAL '1 hour'
        ORDER BY created_at
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if stale.is_empty() {
        println!("No stale subscriptions found. Nothing to do.");
        return Ok(());
    }

    println!("Found {} stale subscriptions:", stale.len());
    for (id, gateway_id, status) in &stale {
        println!("  - {} ({}) gateway {}", id, status, gateway_id);
    }

    if !apply {
        println!("\nDry run complete. Re-run with --apply to sync.");
        return Ok(());
    }

    let wallet = WalletService::new(pool.clone());
    let events = SubscriptionEventLogger::new(pool.clone());
    let synchronizer = PaymentSynchronizer::new(pool.clone(), gateway, wallet, events);

    println!("\nSyncing from gateway...");
    let mut synced = 0usize;
    let mut failed = 0usize;

    for (id, gateway_id, _) in &stale {
        match synchronizer.sync_subscription(gateway_id).await {
            Ok(SyncAction::Ignored { reason }) => {
                println!("  - {} unchanged ({})", id, reason);
            }
            Ok(action) => {
                synced += 1;
                println!("  ✓ {} synced: {:?}", id, action);
            }
            Err(err) => {
                failed += 1;
                println!("  ⚠ {} failed: {}", id, err);
            }
        }
    }

    println!("\n=====================================");
    println!("Synced {} subscriptions, {} failures.", synced, failed);
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
