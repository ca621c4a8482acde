//! Agendou Background Worker
//!
//! Scheduled billing jobs:
//! - Dunning sweep (every 20 minutes)
//! - Polling fallback re-syncing stale checkouts with the gateway (hourly)
//! - Reminder mark retention purge (daily at 3:00 UTC)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use agendou_billing::{
    DunningConfig, DunningMonitor, GatewayClient, HttpMessenger, PaymentSynchronizer,
    SubscriptionEventLogger, WalletService,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reminder marks older than this are dropped by the retention job
const REMINDER_MARK_RETENTION_DAYS: i64 = 90;

/// Re-sync one stale checkout against the gateway, retrying transient
/// failures with backoff
async fn resync_stale_subscription(
    synchronizer: &PaymentSynchronizer,
    subscription_id: Uuid,
    preapproval_id: &str,
) -> anyhow::Result<()> {
    let retry_strategy = ExponentialBackoff::from_millis(500)
        .max_delay(Duration::from_secs(10))
        .take(3)
        .map(jitter);

    Retry::spawn(retry_strategy, || async {
        synchronizer.sync_subscription(preapproval_id).await
    })
    .await
    .map_err(|e| anyhow::anyhow!("subscription {} resync failed: {}", subscription_id, e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    dotenvy::dotenv().ok();

    info!("Starting Agendou worker");

    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = agendou_shared::create_pool(&database_url).await?;
    info!("Database pool created");

    let gateway = match GatewayClient::from_env() {
        Ok(g) => g,
        Err(e) => {
            // Without gateway credentials there is nothing to sync or dun;
            // stay alive so the deployment doesn't crash-loop
            warn!(error = %e, "Gateway not configured - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    let wallet = WalletService::new(pool.clone());
    let events = SubscriptionEventLogger::new(pool.clone());
    let synchronizer = PaymentSynchronizer::new(pool.clone(), gateway, wallet, events);
    let monitor = Arc::new(DunningMonitor::new(
        pool.clone(),
        HttpMessenger::from_env(),
        DunningConfig::from_env(),
    ));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Dunning sweep every 20 minutes
    let dunning_monitor = monitor.clone();
    scheduler
        .add(Job::new_async("0 */20 * * * *", move |_uuid, _l| {
            let monitor = dunning_monitor.clone();
            Box::pin(async move {
                info!("Running dunning sweep");
                if let Err(e) = monitor.tick().await {
                    error!(error = %e, "Dunning sweep failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning sweep (every 20 minutes)");

    // Job 2: Polling fallback (hourly, at :30)
    // Webhook delivery is best-effort; checkouts stuck in initiated or
    // pending are re-fetched from the gateway and converged
    let fallback_pool = pool.clone();
    let fallback_synchronizer = synchronizer.clone();
    scheduler
        .add(Job::new_async("0 30 * * * *", move |_uuid, _l| {
            let pool = fallback_pool.clone();
            let synchronizer = fallback_synchronizer.clone();
            Box::pin(async move {
                info!("Running gateway polling fallback");

                let stale: Vec<(Uuid, String)> = sqlx::query_as(
                    r#"
                    SELECT id, gateway_subscription_id
                    FROM subscriptions
                    WHERE status IN ('initiated', 'pending')
                      AND gateway_subscription_id IS NOT NULL
                      AND updated_at < NOW() - INTERVAL '30 minutes'
                    ORDER BY updated_at ASC
                    LIMIT 100
                    "#,
                )
                .fetch_all(&pool)
                .await
                .unwrap_or_default();

                let total = stale.len();
                let mut errors = 0;
                for (subscription_id, preapproval_id) in stale {
                    if let Err(e) =
                        resync_stale_subscription(&synchronizer, subscription_id, &preapproval_id)
                            .await
                    {
                        error!(subscription_id = %subscription_id, error = %e, "Stale checkout resync failed");
                        errors += 1;
                    }
                }

                info!(
                    total = total,
                    errors = errors,
                    "Polling fallback complete"
                );
            })
        })?)
        .await?;
    info!("Scheduled: Gateway polling fallback (hourly)");

    // Job 3: Reminder mark retention purge (daily at 3:00 UTC)
    let purge_monitor = monitor.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let monitor = purge_monitor.clone();
            Box::pin(async move {
                if let Err(e) = monitor.purge_old_marks(REMINDER_MARK_RETENTION_DAYS).await {
                    error!(error = %e, "Reminder mark purge failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Reminder mark purge (daily 3:00 UTC)");

    // Job 4: Heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
