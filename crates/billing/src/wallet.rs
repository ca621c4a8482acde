//! Prepaid message-credit wallet service
//!
//! One wallet row per tenant, split into a plan-included bucket that resets
//! each calendar month and a purchased-extra bucket that never expires.
//! Every balance mutation is paired, in the same transaction, with exactly
//! one immutable ledger row; the unique idempotency key on the ledger is the
//! at-most-once fence for debits and credits. All read-modify-write
//! sequences run under a `SELECT ... FOR UPDATE` row lock on the tenant's
//! wallet, giving per-tenant serializability.

use agendou_shared::{
    BlockReason, DebitBucket, Plan, PlanStatus, Wallet, WalletTransactionKind,
};
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::packages::CreditPackage;

/// Result of a debit attempt. Blocking conditions are structured results,
/// not errors: the caller's appointment flow proceeds regardless.
#[derive(Debug, Clone)]
pub enum DebitOutcome {
    /// One credit consumed from the given bucket
    Debited { bucket: DebitBucket, wallet: Wallet },
    /// The idempotency key was already recorded; balances untouched
    Idempotent,
    /// No send: logged as a `blocked` ledger row
    Blocked { reason: BlockReason },
}

/// Result of a top-up credit
#[derive(Debug, Clone)]
pub enum CreditOutcome {
    Credited { wallet: Wallet },
    /// The payment id was already credited; balances untouched
    Idempotent,
}

/// Wallet snapshot for the tenant dashboard
#[derive(Debug, Clone, Serialize)]
pub struct WalletSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub cycle_end: OffsetDateTime,
    pub included_limit: i32,
    pub included_balance: i32,
    pub extra_balance: i32,
    pub total_balance: i32,
}

impl From<Wallet> for WalletSnapshot {
    fn from(w: Wallet) -> Self {
        Self {
            cycle_start: w.cycle_start,
            cycle_end: w.cycle_end,
            included_limit: w.included_limit,
            included_balance: w.included_balance,
            extra_balance: w.extra_balance,
            total_balance: w.included_balance + w.extra_balance,
        }
    }
}

/// Plan context resolved from the tenant row (plan catalog seam)
#[derive(Debug, Clone, Copy)]
struct PlanContext {
    plan: Option<Plan>,
    status: PlanStatus,
    whatsapp_enabled: bool,
}

impl PlanContext {
    /// Monthly allotment this tenant currently resolves to. Delinquent,
    /// inactive, and WhatsApp-disabled tenants resolve to 0.
    fn included_limit(&self) -> i32 {
        if matches!(self.status, PlanStatus::Delinquent | PlanStatus::Inactive) {
            return 0;
        }
        if !self.whatsapp_enabled {
            return 0;
        }
        self.plan.map(|p| p.included_messages()).unwrap_or(0)
    }

    fn max_messages_per_appointment(&self) -> i64 {
        self.plan.map(|p| p.max_messages_per_appointment()).unwrap_or(5)
    }
}

/// Wallet service
#[derive(Clone)]
pub struct WalletService {
    pool: PgPool,
}

impl WalletService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Current balances, ensuring the wallet row exists and its cycle
    /// window is fresh
    pub async fn snapshot(&self, tenant_id: Uuid) -> BillingResult<WalletSnapshot> {
        let mut tx = self.pool.begin().await?;
        let (wallet, _) = self.locked_wallet(&mut tx, tenant_id).await?;
        tx.commit().await?;
        Ok(wallet.into())
    }

    /// Consume one message credit, included bucket first.
    ///
    /// `provider_message_id` is the transport's own message id and doubles
    /// as the idempotency key: replaying the same id never debits twice.
    pub async fn debit(
        &self,
        tenant_id: Uuid,
        provider_message_id: &str,
        appointment_ref: Option<Uuid>,
    ) -> BillingResult<DebitOutcome> {
        if provider_message_id.is_empty() {
            return Err(BillingError::InvalidInput(
                "provider_message_id must not be empty".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let (wallet, plan) = self.locked_wallet(&mut tx, tenant_id).await?;

        // Per-appointment cap applies regardless of remaining balance
        if let Some(appointment) = appointment_ref {
            let sent: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM wallet_transactions
                WHERE tenant_id = $1 AND appointment_ref = $2 AND kind = 'debit'
                "#,
            )
            .bind(tenant_id)
            .bind(appointment)
            .fetch_one(&mut *tx)
            .await?;

            if sent >= plan.max_messages_per_appointment() {
                return self
                    .record_block(
                        tx,
                        tenant_id,
                        provider_message_id,
                        appointment_ref,
                        BlockReason::PerAppointmentLimit,
                    )
                    .await;
            }
        }

        let bucket = if wallet.included_balance > 0 {
            DebitBucket::Included
        } else if wallet.extra_balance > 0 {
            DebitBucket::Extra
        } else {
            return self
                .record_block(
                    tx,
                    tenant_id,
                    provider_message_id,
                    appointment_ref,
                    BlockReason::InsufficientBalance,
                )
                .await;
        };

        let (included_delta, extra_delta) = match bucket {
            DebitBucket::Included => (-1, 0),
            DebitBucket::Extra => (0, -1),
        };

        let inserted = self
            .append_ledger(
                &mut tx,
                tenant_id,
                WalletTransactionKind::Debit,
                included_delta,
                extra_delta,
                appointment_ref,
                Some(provider_message_id),
                serde_json::json!({ "bucket": bucket }),
            )
            .await?;

        if !inserted {
            tx.commit().await?;
            tracing::debug!(
                tenant_id = %tenant_id,
                provider_message_id = %provider_message_id,
                "Debit replay ignored (idempotency key already recorded)"
            );
            return Ok(DebitOutcome::Idempotent);
        }

        let wallet: Wallet = sqlx::query_as(
            r#"
            UPDATE wallets
            SET included_balance = included_balance + $2,
                extra_balance = extra_balance + $3,
                updated_at = NOW()
            WHERE tenant_id = $1
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(included_delta)
        .bind(extra_delta)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            bucket = ?bucket,
            included_balance = wallet.included_balance,
            extra_balance = wallet.extra_balance,
            "Message credit debited"
        );
        Ok(DebitOutcome::Debited { bucket, wallet })
    }

    /// Credit a purchased top-up package, keyed by the gateway payment id
    pub async fn credit(
        &self,
        tenant_id: Uuid,
        package_id: &str,
        payment_id: &str,
    ) -> BillingResult<CreditOutcome> {
        let package = CreditPackage::from_id(package_id)
            .ok_or_else(|| BillingError::PackageInvalid(package_id.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let _ = self.locked_wallet(&mut tx, tenant_id).await?;

        let inserted = self
            .append_ledger(
                &mut tx,
                tenant_id,
                WalletTransactionKind::TopupCredit,
                0,
                package.messages(),
                None,
                Some(payment_id),
                serde_json::json!({ "package": package.id(), "payment_id": payment_id }),
            )
            .await?;

        if !inserted {
            tx.commit().await?;
            tracing::info!(
                tenant_id = %tenant_id,
                payment_id = %payment_id,
                "Top-up replay ignored (payment already credited)"
            );
            return Ok(CreditOutcome::Idempotent);
        }

        let wallet: Wallet = sqlx::query_as(
            r#"
            UPDATE wallets
            SET extra_balance = extra_balance + $2, updated_at = NOW()
            WHERE tenant_id = $1
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(package.messages())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            package = %package,
            extra_balance = wallet.extra_balance,
            "Top-up credited"
        );
        Ok(CreditOutcome::Credited { wallet })
    }

    /// Lock the tenant's wallet row for the rest of the transaction,
    /// provisioning it on first access and rolling the cycle when the
    /// stored window or included limit is stale
    async fn locked_wallet(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
    ) -> BillingResult<(Wallet, PlanContext)> {
        let plan = self.plan_context(tx, tenant_id).await?;
        let limit = plan.included_limit();

        let existing: Option<Wallet> =
            sqlx::query_as("SELECT * FROM wallets WHERE tenant_id = $1 FOR UPDATE")
                .bind(tenant_id)
                .fetch_optional(&mut **tx)
                .await?;

        let wallet = match existing {
            None => self.provision(tx, tenant_id, limit).await?,
            Some(wallet) => {
                let now = OffsetDateTime::now_utc();
                if now >= wallet.cycle_end || now < wallet.cycle_start {
                    self.roll_cycle(tx, wallet, limit, now).await?
                } else if wallet.included_limit != limit {
                    self.apply_limit_change(tx, wallet, limit).await?
                } else {
                    wallet
                }
            }
        };

        Ok((wallet, plan))
    }

    async fn plan_context(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
    ) -> BillingResult<PlanContext> {
        let row: Option<(Option<Plan>, PlanStatus, bool)> = sqlx::query_as(
            "SELECT plan, plan_status, whatsapp_enabled FROM tenants WHERE id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&mut **tx)
        .await?;

        let (plan, status, whatsapp_enabled) =
            row.ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;
        Ok(PlanContext {
            plan,
            status,
            whatsapp_enabled,
        })
    }

    /// First access: insert the wallet row and its opening ledger row so
    /// the ledger-sum invariant holds from birth
    async fn provision(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        limit: i32,
    ) -> BillingResult<Wallet> {
        let (cycle_start, cycle_end) = month_window(OffsetDateTime::now_utc());

        let inserted: Option<Wallet> = sqlx::query_as(
            r#"
            INSERT INTO wallets (tenant_id, cycle_start, cycle_end, included_limit, included_balance, extra_balance)
            VALUES ($1, $2, $3, $4, $4, 0)
            ON CONFLICT (tenant_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(cycle_start)
        .bind(cycle_end)
        .bind(limit)
        .fetch_optional(&mut **tx)
        .await?;

        match inserted {
            Some(wallet) => {
                self.append_ledger(
                    tx,
                    tenant_id,
                    WalletTransactionKind::CycleReset,
                    limit,
                    0,
                    None,
                    None,
                    serde_json::json!({ "reason": "provisioned", "cycle_start": cycle_start.to_string() }),
                )
                .await?;
                tracing::info!(tenant_id = %tenant_id, included_limit = limit, "Wallet provisioned");
                Ok(wallet)
            }
            // Lost a provisioning race; block on the winner's row lock
            None => {
                let wallet: Wallet =
                    sqlx::query_as("SELECT * FROM wallets WHERE tenant_id = $1 FOR UPDATE")
                        .bind(tenant_id)
                        .fetch_one(&mut **tx)
                        .await?;
                Ok(wallet)
            }
        }
    }

    /// Calendar-month rollover: included resets to the current allotment,
    /// purchased extra credits are untouched
    async fn roll_cycle(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        wallet: Wallet,
        limit: i32,
        now: OffsetDateTime,
    ) -> BillingResult<Wallet> {
        let (cycle_start, cycle_end) = month_window(now);

        self.append_ledger(
            tx,
            wallet.tenant_id,
            WalletTransactionKind::CycleReset,
            limit - wallet.included_balance,
            0,
            None,
            None,
            serde_json::json!({ "reason": "rollover", "cycle_start": cycle_start.to_string() }),
        )
        .await?;

        let updated: Wallet = sqlx::query_as(
            r#"
            UPDATE wallets
            SET cycle_start = $2, cycle_end = $3, included_limit = $4,
                included_balance = $4, updated_at = NOW()
            WHERE tenant_id = $1
            RETURNING *
            "#,
        )
        .bind(wallet.tenant_id)
        .bind(cycle_start)
        .bind(cycle_end)
        .bind(limit)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            tenant_id = %wallet.tenant_id,
            included_limit = limit,
            cycle_start = %cycle_start,
            "Wallet cycle rolled over"
        );
        Ok(updated)
    }

    /// Mid-cycle plan change: preserve "messages already consumed this
    /// cycle" rather than resetting or over-crediting
    async fn apply_limit_change(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        wallet: Wallet,
        new_limit: i32,
    ) -> BillingResult<Wallet> {
        let new_balance =
            rebalance_for_limit_change(wallet.included_limit, wallet.included_balance, new_limit);

        self.append_ledger(
            tx,
            wallet.tenant_id,
            WalletTransactionKind::CycleReset,
            new_balance - wallet.included_balance,
            0,
            None,
            None,
            serde_json::json!({
                "reason": "limit_change",
                "old_limit": wallet.included_limit,
                "new_limit": new_limit,
            }),
        )
        .await?;

        let updated: Wallet = sqlx::query_as(
            r#"
            UPDATE wallets
            SET included_limit = $2, included_balance = $3, updated_at = NOW()
            WHERE tenant_id = $1
            RETURNING *
            "#,
        )
        .bind(wallet.tenant_id)
        .bind(new_limit)
        .bind(new_balance)
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            tenant_id = %wallet.tenant_id,
            old_limit = wallet.included_limit,
            new_limit = new_limit,
            included_balance = new_balance,
            "Wallet limit changed mid-cycle"
        );
        Ok(updated)
    }

    /// Record a blocked debit attempt. Blocked rows carry the idempotency
    /// key and share the unique constraint, so a replayed blocked debit is
    /// idempotent and the same provider message id can never debit later.
    async fn record_block(
        &self,
        mut tx: Transaction<'_, Postgres>,
        tenant_id: Uuid,
        provider_message_id: &str,
        appointment_ref: Option<Uuid>,
        reason: BlockReason,
    ) -> BillingResult<DebitOutcome> {
        let inserted = self
            .append_ledger(
                &mut tx,
                tenant_id,
                WalletTransactionKind::Blocked,
                0,
                0,
                appointment_ref,
                Some(provider_message_id),
                serde_json::json!({ "reason": reason.to_string() }),
            )
            .await?;
        tx.commit().await?;

        if !inserted {
            return Ok(DebitOutcome::Idempotent);
        }

        tracing::warn!(
            tenant_id = %tenant_id,
            reason = %reason,
            provider_message_id = %provider_message_id,
            "Message send blocked"
        );
        Ok(DebitOutcome::Blocked { reason })
    }

    /// Append one immutable ledger row. Returns false when the idempotency
    /// key was already present (the unique index rejected the insert).
    #[allow(clippy::too_many_arguments)]
    async fn append_ledger(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: Uuid,
        kind: WalletTransactionKind,
        included_delta: i32,
        extra_delta: i32,
        appointment_ref: Option<Uuid>,
        idempotency_key: Option<&str>,
        metadata: serde_json::Value,
    ) -> BillingResult<bool> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO wallet_transactions
                (tenant_id, kind, delta, included_delta, extra_delta, appointment_ref, idempotency_key, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(tenant_id)
        .bind(kind)
        .bind(included_delta + extra_delta)
        .bind(included_delta)
        .bind(extra_delta)
        .bind(appointment_ref)
        .bind(idempotency_key)
        .bind(metadata)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(inserted.is_some())
    }
}

/// UTC calendar-month window containing `now`
pub(crate) fn month_window(now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
    let start = now
        .replace_day(1)
        .unwrap_or(now)
        .replace_time(time::Time::MIDNIGHT);
    (start, agendou_shared::BillingCycle::Monthly.advance(start))
}

/// Mid-cycle limit change: `used` messages stay consumed across the change
pub(crate) fn rebalance_for_limit_change(old_limit: i32, old_balance: i32, new_limit: i32) -> i32 {
    let used = (old_limit - old_balance).max(0);
    (new_limit - used).max(0)
}
