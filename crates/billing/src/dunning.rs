//! Dunning monitor
//!
//! Periodic sweep over tenants with a paid or trialing plan. Pure
//! classification first (`classify`), then side effects: at most one
//! reminder per (tenant, due date, kind, channel), enforced by a partial
//! unique index over non-released reminder marks, and a guarded flip to
//! `delinquent` once the grace window runs out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agendou_shared::{
    PlanStatus, ReminderChannel, ReminderKind, ReminderMarkStatus, Tenant,
};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::notify::{MessageTransport, OutboundMessage};

/// Where a tenant stands relative to their paid window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingState {
    /// In trial, not yet paying; open-ended when no end date is recorded
    Trial { ends_at: Option<OffsetDateTime> },
    /// Paid window comfortably open
    Ok,
    /// Paid window ends within the warn horizon
    DueSoon { due: OffsetDateTime },
    /// Paid window elapsed, still inside grace
    Overdue { due: OffsetDateTime },
    /// Grace exhausted (or trial expired); plan benefits stop
    Blocked,
}

/// Classify a tenant's billing state. Pure so the cutover table is unit
/// testable without a database.
pub fn classify(
    status: PlanStatus,
    active_until: Option<OffsetDateTime>,
    trial_ends_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
    warn: Duration,
    grace: Duration,
) -> BillingState {
    match status {
        PlanStatus::Trialing => match trial_ends_at {
            Some(ends_at) if ends_at <= now => BillingState::Blocked,
            // Absent end date means an open-ended trial, not an expired one
            ends_at => BillingState::Trial { ends_at },
        },
        PlanStatus::Delinquent | PlanStatus::Inactive => BillingState::Blocked,
        PlanStatus::Active => match active_until {
            // Manually granted plans have no window to dun against
            None => BillingState::Ok,
            Some(due) => {
                if now < due - warn {
                    BillingState::Ok
                } else if now < due {
                    BillingState::DueSoon { due }
                } else if now < due + grace {
                    BillingState::Overdue { due }
                } else {
                    BillingState::Blocked
                }
            }
        },
    }
}

/// Dunning window configuration
#[derive(Debug, Clone)]
pub struct DunningConfig {
    /// Days before the window ends that the first reminder goes out
    pub warn_days: i64,
    /// Days after the window ends before benefits are cut
    pub grace_days: i64,
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            warn_days: 5,
            grace_days: 10,
        }
    }
}

impl DunningConfig {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            warn_days: std::env::var("DUNNING_WARN_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.warn_days),
            grace_days: std::env::var("DUNNING_GRACE_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.grace_days),
        }
    }

    fn warn(&self) -> Duration {
        Duration::days(self.warn_days)
    }

    fn grace(&self) -> Duration {
        Duration::days(self.grace_days)
    }
}

/// Dunning monitor, driven by the worker's cron schedule
pub struct DunningMonitor<T: MessageTransport> {
    pool: PgPool,
    transport: T,
    config: DunningConfig,
    running: Arc<AtomicBool>,
}

impl<T: MessageTransport> DunningMonitor<T> {
    pub fn new(pool: PgPool, transport: T, config: DunningConfig) -> Self {
        Self {
            pool,
            transport,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// One sweep over all dunnable tenants. Ticks overlap-protect
    /// themselves: if the previous sweep is still running, this one is a
    /// no-op.
    pub async fn tick(&self) -> BillingResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::warn!("Dunning sweep still running, skipping tick");
            return Ok(());
        }

        let result = self.sweep().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn sweep(&self) -> BillingResult<()> {
        let tenants: Vec<Tenant> = sqlx::query_as(
            r#"
            SELECT * FROM tenants
            WHERE plan_status IN ('trialing', 'active')
              AND (plan_active_until IS NOT NULL OR plan_trial_ends_at IS NOT NULL)
            ORDER BY plan_active_until ASC NULLS LAST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let now = OffsetDateTime::now_utc();
        let mut reminded = 0u32;
        let mut suspended = 0u32;

        for tenant in &tenants {
            let state = classify(
                tenant.plan_status,
                tenant.plan_active_until,
                tenant.plan_trial_ends_at,
                now,
                self.config.warn(),
                self.config.grace(),
            );

            // One tenant's failure must not starve the rest of the sweep
            let outcome = match state {
                BillingState::Ok | BillingState::Trial { .. } => Ok((false, false)),
                BillingState::DueSoon { due } => self
                    .remind(tenant, ReminderKind::DueSoon, due)
                    .await
                    .map(|sent| (sent, false)),
                BillingState::Overdue { due } => self
                    .remind(tenant, ReminderKind::OverdueGrace, due)
                    .await
                    .map(|sent| (sent, false)),
                BillingState::Blocked => self.suspend(tenant, now).await.map(|s| (s, s)),
            };

            match outcome {
                Ok((sent, was_suspended)) => {
                    reminded += u32::from(sent);
                    suspended += u32::from(was_suspended);
                }
                Err(e) => {
                    tracing::error!(
                        tenant_id = %tenant.id,
                        error = %e,
                        "Dunning pass failed for tenant"
                    );
                }
            }
        }

        tracing::info!(
            scanned = tenants.len(),
            reminded = reminded,
            suspended = suspended,
            "Dunning sweep complete"
        );
        Ok(())
    }

    /// Flip a tenant whose window (paid or trial) ran out to delinquent,
    /// exactly once. The guarded update is the idempotency fence: a
    /// concurrent payment approval (which sets `active`) wins over the flip.
    async fn suspend(&self, tenant: &Tenant, now: OffsetDateTime) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET plan_status = 'delinquent', updated_at = NOW()
            WHERE id = $1 AND plan_status IN ('trialing', 'active')
            "#,
        )
        .bind(tenant.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        tracing::warn!(
            tenant_id = %tenant.id,
            plan = ?tenant.plan,
            "Tenant moved to delinquent after grace period"
        );

        let due = tenant.plan_active_until.unwrap_or(now);
        self.remind(tenant, ReminderKind::Suspended, due).await?;
        Ok(true)
    }

    /// Send one reminder, fenced by the reminder mark reservation
    async fn remind(
        &self,
        tenant: &Tenant,
        kind: ReminderKind,
        due: OffsetDateTime,
    ) -> BillingResult<bool> {
        let Some(message) = self.compose(tenant, kind, due) else {
            tracing::debug!(tenant_id = %tenant.id, kind = %kind, "No reachable channel for reminder");
            return Ok(false);
        };

        let due_date = due.date();
        let reservation: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO reminder_marks (tenant_id, due_date, kind, channel, status)
            VALUES ($1, $2, $3, $4, 'reserved')
            ON CONFLICT (tenant_id, due_date, kind, channel) WHERE status <> 'released'
            DO NOTHING
            RETURNING id
            "#,
        )
        .bind(tenant.id)
        .bind(due_date)
        .bind(kind)
        .bind(message.channel)
        .fetch_optional(&self.pool)
        .await?;

        let Some((mark_id,)) = reservation else {
            // Already reserved or sent for this due date
            return Ok(false);
        };

        let delivered = self.transport.send(&message).await.unwrap_or(false);
        let status = if delivered {
            ReminderMarkStatus::Sent
        } else {
            ReminderMarkStatus::Released
        };

        sqlx::query(
            r#"
            UPDATE reminder_marks
            SET status = $2, sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END
            WHERE id = $1
            "#,
        )
        .bind(mark_id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        if delivered {
            tracing::info!(
                tenant_id = %tenant.id,
                kind = %kind,
                channel = %message.channel,
                "Dunning reminder sent"
            );
        }
        Ok(delivered)
    }

    /// Pick the tenant's preferred reachable channel and build the copy
    fn compose(
        &self,
        tenant: &Tenant,
        kind: ReminderKind,
        due: OffsetDateTime,
    ) -> Option<OutboundMessage> {
        let (channel, to) = if tenant.notify_whatsapp && tenant.whatsapp_number.is_some() {
            (ReminderChannel::Whatsapp, tenant.whatsapp_number.clone()?)
        } else if tenant.notify_email && tenant.email.is_some() {
            (ReminderChannel::Email, tenant.email.clone()?)
        } else {
            return None;
        };

        let due_date = due.date();
        let (subject, body) = match kind {
            ReminderKind::DueSoon => (
                "Seu plano Agendou vence em breve".to_string(),
                format!(
                    "Olá, {}! Seu plano vence em {}. Renove para continuar \
                     enviando lembretes aos seus clientes sem interrupção.",
                    tenant.name, due_date
                ),
            ),
            ReminderKind::OverdueGrace => (
                "Pagamento do plano Agendou em atraso".to_string(),
                format!(
                    "Olá, {}! Não identificamos o pagamento do seu plano, vencido \
                     em {}. Regularize para evitar a suspensão dos envios.",
                    tenant.name, due_date
                ),
            ),
            ReminderKind::Suspended => (
                "Plano Agendou suspenso".to_string(),
                format!(
                    "Olá, {}! Seu plano foi suspenso por falta de pagamento. \
                     Os lembretes automáticos estão pausados. Renove para reativar.",
                    tenant.name
                ),
            ),
        };

        Some(OutboundMessage {
            channel,
            to,
            subject,
            body,
        })
    }

    /// Drop reminder marks older than the retention window. The fence only
    /// needs marks for the current dunning episode; old rows are noise.
    pub async fn purge_old_marks(&self, retention_days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            "DELETE FROM reminder_marks WHERE created_at < NOW() - make_interval(days => $1::int)",
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!(purged = purged, "Old reminder marks purged");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use time::macros::datetime;

    const WARN: Duration = Duration::days(5);
    const GRACE: Duration = Duration::days(10);

    fn at(now: OffsetDateTime, status: PlanStatus, until: Option<OffsetDateTime>) -> BillingState {
        classify(status, until, None, now, WARN, GRACE)
    }

    #[test]
    fn test_active_window_states() {
        let due = datetime!(2025-06-20 00:00 UTC);

        // Comfortably inside the window
        assert_eq!(
            at(datetime!(2025-06-01 00:00 UTC), PlanStatus::Active, Some(due)),
            BillingState::Ok
        );
        // Warn horizon opens exactly warn_days before due
        assert_eq!(
            at(datetime!(2025-06-15 00:00 UTC), PlanStatus::Active, Some(due)),
            BillingState::DueSoon { due }
        );
        assert_eq!(
            at(datetime!(2025-06-19 23:59 UTC), PlanStatus::Active, Some(due)),
            BillingState::DueSoon { due }
        );
        // Past due, inside grace
        assert_eq!(
            at(datetime!(2025-06-20 00:00 UTC), PlanStatus::Active, Some(due)),
            BillingState::Overdue { due }
        );
        assert_eq!(
            at(datetime!(2025-06-29 12:00 UTC), PlanStatus::Active, Some(due)),
            BillingState::Overdue { due }
        );
        // Grace exhausted
        assert_eq!(
            at(datetime!(2025-06-30 00:00 UTC), PlanStatus::Active, Some(due)),
            BillingState::Blocked
        );
    }

    #[test]
    fn test_active_without_window_is_ok() {
        assert_eq!(
            at(datetime!(2025-06-01 00:00 UTC), PlanStatus::Active, None),
            BillingState::Ok
        );
    }

    #[test]
    fn test_trial_states() {
        let now = datetime!(2025-06-10 00:00 UTC);
        let ends_at = datetime!(2025-06-17 00:00 UTC);
        assert_eq!(
            classify(PlanStatus::Trialing, None, Some(ends_at), now, WARN, GRACE),
            BillingState::Trial {
                ends_at: Some(ends_at)
            }
        );
        // Expired trial blocks immediately, no grace
        assert_eq!(
            classify(
                PlanStatus::Trialing,
                None,
                Some(datetime!(2025-06-09 00:00 UTC)),
                now,
                WARN,
                GRACE
            ),
            BillingState::Blocked
        );
        // No end date recorded: the trial is open-ended, never cut off
        assert_eq!(
            classify(PlanStatus::Trialing, None, None, now, WARN, GRACE),
            BillingState::Trial { ends_at: None }
        );
    }

    #[test]
    fn test_terminal_states_block() {
        let now = datetime!(2025-06-10 00:00 UTC);
        assert_eq!(
            at(now, PlanStatus::Delinquent, Some(datetime!(2025-07-01 00:00 UTC))),
            BillingState::Blocked
        );
        assert_eq!(at(now, PlanStatus::Inactive, None), BillingState::Blocked);
    }
}
