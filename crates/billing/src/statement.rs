//! Wallet statement queries
//!
//! Read-only views over the wallet ledger for the tenant dashboard and
//! for support: recent movements, and a per-cycle summary reconciling the
//! ledger against the live balances.

use agendou_shared::{Wallet, WalletTransaction};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Ledger activity totals for one cycle window
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_end: OffsetDateTime,
    pub debited: i64,
    pub credited: i64,
    pub blocked: i64,
}

pub struct WalletStatementService {
    pool: PgPool,
}

impl WalletStatementService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Recent ledger rows for a tenant, newest first
    pub async fn recent(
        &self,
        tenant_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM wallet_transactions
            WHERE tenant_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Activity totals for the tenant's current cycle window
    pub async fn current_cycle_summary(&self, tenant_id: Uuid) -> BillingResult<CycleSummary> {
        let wallet: Option<Wallet> = sqlx::query_as("SELECT * FROM wallets WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        let wallet = wallet.ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;

        let (debited, credited, blocked): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE kind = 'debit'),
                COALESCE(SUM(extra_delta) FILTER (WHERE kind = 'topup_credit'), 0),
                COUNT(*) FILTER (WHERE kind = 'blocked')
            FROM wallet_transactions
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
            "#,
        )
        .bind(tenant_id)
        .bind(wallet.cycle_start)
        .bind(wallet.cycle_end)
        .fetch_one(&self.pool)
        .await?;

        Ok(CycleSummary {
            cycle_start: wallet.cycle_start,
            cycle_end: wallet.cycle_end,
            debited,
            credited,
            blocked,
        })
    }
}
