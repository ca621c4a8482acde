//! Common types used across Agendou

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Essencial,
    Pro,
    Premium,
}

impl Plan {
    /// WhatsApp/email message credits included per calendar month
    pub fn included_messages(&self) -> i32 {
        match self {
            Self::Essencial => 250,
            Self::Pro => 1_500,
            Self::Premium => 5_000,
        }
    }

    /// Hard cap on reminder messages for a single appointment,
    /// independent of remaining wallet balance
    pub fn max_messages_per_appointment(&self) -> i64 {
        5
    }

    /// Price in cents (BRL) for a billing cycle
    pub fn price_cents(&self, cycle: BillingCycle) -> i64 {
        let monthly = match self {
            Self::Essencial => 4_990,
            Self::Pro => 9_990,
            Self::Premium => 19_990,
        };
        match cycle {
            BillingCycle::Monthly => monthly,
            // Yearly is ten months for the price of twelve
            BillingCycle::Yearly => monthly * 10,
        }
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Essencial => write!(f, "essencial"),
            Self::Pro => write!(f, "pro"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "essencial" => Ok(Self::Essencial),
            "pro" => Ok(Self::Pro),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown plan: {}", other)),
        }
    }
}

/// Billing cycle for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Advance a timestamp by one billing cycle, clamping the day when the
    /// target month is shorter (Jan 31 + 1 month = Feb 28/29)
    pub fn advance(&self, from: OffsetDateTime) -> OffsetDateTime {
        let months = match self {
            Self::Monthly => 1,
            Self::Yearly => 12,
        };
        add_months(from, months)
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

impl std::str::FromStr for BillingCycle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            // pt-BR checkout tokens use "mensal"/"anual"
            "monthly" | "mensal" => Ok(Self::Monthly),
            "yearly" | "anual" => Ok(Self::Yearly),
            other => Err(format!("unknown billing cycle: {}", other)),
        }
    }
}

/// Add whole calendar months, clamping the day-of-month
fn add_months(from: OffsetDateTime, months: i32) -> OffsetDateTime {
    let total = (from.year() * 12 + from.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month = time::Month::January.nth_next(total.rem_euclid(12) as u8);
    let max_day = time::util::days_in_month(month, year);
    let day = from.day().min(max_day);
    from.replace_day(1)
        .and_then(|d| d.replace_year(year))
        .and_then(|d| d.replace_month(month))
        .and_then(|d| d.replace_day(day))
        .unwrap_or(from)
}

/// Subscription lifecycle status.
/// Mutated only by the payment synchronizer; rows are never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Initiated,
    Pending,
    Authorized,
    Active,
    Paused,
    PastDue,
    Canceled,
    Expired,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initiated => "initiated",
            Self::Pending => "pending",
            Self::Authorized => "authorized",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// Tenant-level plan status, projected onto the tenant row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Trialing,
    Active,
    Delinquent,
    Inactive,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trialing => write!(f, "trialing"),
            Self::Active => write!(f, "active"),
            Self::Delinquent => write!(f, "delinquent"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// Kind of an immutable wallet ledger row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WalletTransactionKind {
    CycleReset,
    Debit,
    TopupCredit,
    Blocked,
}

/// Which balance bucket a debit consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebitBucket {
    Included,
    Extra,
}

/// Why a debit was blocked instead of applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    InsufficientBalance,
    PerAppointmentLimit,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InsufficientBalance => write!(f, "insufficient_balance"),
            Self::PerAppointmentLimit => write!(f, "per_appointment_limit"),
        }
    }
}

/// Kind of dunning reminder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    DueSoon,
    OverdueGrace,
    Suspended,
}

impl std::fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DueSoon => write!(f, "due_soon"),
            Self::OverdueGrace => write!(f, "overdue_grace"),
            Self::Suspended => write!(f, "suspended"),
        }
    }
}

/// Delivery channel for a reminder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReminderChannel {
    Email,
    Whatsapp,
}

impl std::fmt::Display for ReminderChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Whatsapp => write!(f, "whatsapp"),
        }
    }
}

/// Three-state reminder reservation: reserved → sent on success, or
/// reserved → released on send failure. Released rows no longer fence the
/// uniqueness constraint, so a later tick can retry the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ReminderMarkStatus {
    Reserved,
    Sent,
    Released,
}

// =============================================================================
// Row Models
// =============================================================================

/// Billing projection of a tenant (establishment) record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub whatsapp_number: Option<String>,
    pub plan: Option<Plan>,
    pub plan_status: PlanStatus,
    pub plan_trial_ends_at: Option<OffsetDateTime>,
    pub plan_active_until: Option<OffsetDateTime>,
    pub plan_subscription_id: Option<Uuid>,
    pub plan_cycle: Option<BillingCycle>,
    pub notify_email: bool,
    pub notify_whatsapp: bool,
    pub whatsapp_enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// A subscription record, correlated to the payment gateway
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub plan: Plan,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub amount_cents: i64,
    pub currency: String,
    pub gateway_subscription_id: Option<String>,
    pub gateway_preference_id: Option<String>,
    pub external_reference: String,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    /// Last processed gateway event id; the idempotency watermark
    pub last_event_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Append-only audit row; one per processed gateway notification
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubscriptionEvent {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub gateway_event_id: Option<String>,
    pub raw_payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Per-tenant prepaid message-credit wallet.
/// Invariants: included_balance <= included_limit; both balances >= 0.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Wallet {
    pub tenant_id: Uuid,
    pub cycle_start: OffsetDateTime,
    pub cycle_end: OffsetDateTime,
    pub included_limit: i32,
    pub included_balance: i32,
    pub extra_balance: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Immutable wallet ledger row. Every balance mutation pairs with exactly
/// one of these in the same transaction; the wallet's running balance always
/// equals the sum of its ledger deltas.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: WalletTransactionKind,
    pub delta: i32,
    pub included_delta: i32,
    pub extra_delta: i32,
    pub appointment_ref: Option<Uuid>,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Reminder de-duplication fence (not message content storage)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReminderMark {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub due_date: time::Date,
    pub kind: ReminderKind,
    pub channel: ReminderChannel,
    pub status: ReminderMarkStatus,
    pub sent_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_plan_included_messages() {
        assert_eq!(Plan::Essencial.included_messages(), 250);
        assert_eq!(Plan::Pro.included_messages(), 1_500);
        assert_eq!(Plan::Premium.included_messages(), 5_000);
    }

    #[test]
    fn test_plan_round_trip() {
        for plan in [Plan::Essencial, Plan::Pro, Plan::Premium] {
            assert_eq!(plan.to_string().parse::<Plan>(), Ok(plan));
        }
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn test_cycle_accepts_portuguese_tokens() {
        assert_eq!("mensal".parse::<BillingCycle>(), Ok(BillingCycle::Monthly));
        assert_eq!("anual".parse::<BillingCycle>(), Ok(BillingCycle::Yearly));
        assert_eq!("monthly".parse::<BillingCycle>(), Ok(BillingCycle::Monthly));
    }

    #[test]
    fn test_advance_monthly() {
        let from = datetime!(2025-03-15 10:00 UTC);
        assert_eq!(
            BillingCycle::Monthly.advance(from),
            datetime!(2025-04-15 10:00 UTC)
        );
    }

    #[test]
    fn test_advance_clamps_short_months() {
        let from = datetime!(2025-01-31 00:00 UTC);
        assert_eq!(
            BillingCycle::Monthly.advance(from),
            datetime!(2025-02-28 00:00 UTC)
        );
    }

    #[test]
    fn test_advance_yearly_crosses_year() {
        let from = datetime!(2025-11-01 08:30 UTC);
        assert_eq!(
            BillingCycle::Yearly.advance(from),
            datetime!(2026-11-01 08:30 UTC)
        );
    }

    #[test]
    fn test_advance_december_wraps() {
        let from = datetime!(2025-12-05 00:00 UTC);
        assert_eq!(
            BillingCycle::Monthly.advance(from),
            datetime!(2026-01-05 00:00 UTC)
        );
    }
}
