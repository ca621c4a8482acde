//! Shared application state

use std::sync::Arc;

use agendou_billing::{
    CheckoutService, GatewayClient, PaymentSynchronizer, SignatureConfig,
    SubscriptionEventLogger, WalletService, WalletStatementService,
};
use sqlx::PgPool;

use crate::config::Config;

/// State shared by all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub signature: Arc<SignatureConfig>,
    pub synchronizer: PaymentSynchronizer,
    pub checkout: CheckoutService,
    pub wallet: WalletService,
    pub statement: Arc<WalletStatementService>,
    pub events: SubscriptionEventLogger,
}

impl AppState {
    /// Wire the billing services from environment configuration
    pub fn from_env(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let signature = SignatureConfig::from_env()?;
        let gateway = GatewayClient::from_env()?;
        let wallet = WalletService::new(pool.clone());
        let events = SubscriptionEventLogger::new(pool.clone());
        let synchronizer = PaymentSynchronizer::new(
            pool.clone(),
            gateway.clone(),
            wallet.clone(),
            events.clone(),
        );
        let checkout = CheckoutService::new(pool.clone(), gateway, events.clone());
        let statement = Arc::new(WalletStatementService::new(pool.clone()));

        Ok(Self {
            pool,
            config: Arc::new(config),
            signature: Arc::new(signature),
            synchronizer,
            checkout,
            wallet,
            statement,
            events,
        })
    }
}
