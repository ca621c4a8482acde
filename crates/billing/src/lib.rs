//! Agendou Billing
//!
//! Payment-gateway reconciliation and prepaid message-credit ledger:
//! webhook signature verification, the subscription state machine, the
//! per-tenant wallet with idempotent debits/credits and cycle rollover,
//! and the dunning (payment-reminder/suspension) loop.

pub mod checkout;
pub mod client;
pub mod dunning;
pub mod error;
pub mod events;
pub mod notify;
pub mod packages;
pub mod signature;
pub mod statement;
pub mod sync;
pub mod wallet;

pub use checkout::{CheckoutResponse, CheckoutService};
pub use client::{GatewayClient, GatewayConfig, GatewayPayment, GatewayPreapproval};
pub use dunning::{classify, BillingState, DunningConfig, DunningMonitor};
pub use error::{BillingError, BillingResult};
pub use events::{SubscriptionEventLogger, SubscriptionEventType};
pub use notify::{HttpMessenger, MessageTransport, MessengerConfig, OutboundMessage};
pub use packages::CreditPackage;
pub use signature::{SignatureConfig, SignatureFailure, Verification, WebhookRequest};
pub use statement::{CycleSummary, WalletStatementService};
pub use sync::{PaymentSynchronizer, SyncAction};
pub use wallet::{CreditOutcome, DebitOutcome, WalletService, WalletSnapshot};
