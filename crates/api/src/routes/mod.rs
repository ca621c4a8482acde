//! API routes

pub mod billing;
pub mod health;
pub mod wallet;
pub mod webhooks;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Gateway notifications; auth is the HMAC signature, not a session
    let webhook_routes = Router::new()
        .route("/webhooks/mercadopago", post(webhooks::mercadopago))
        .layer(DefaultBodyLimit::max(state.config.webhook_max_body_bytes));

    let tenant_routes = Router::new()
        .route("/tenants/:tenant_id/wallet", get(wallet::get_wallet))
        .route(
            "/tenants/:tenant_id/wallet/statement",
            get(wallet::get_statement),
        )
        .route("/tenants/:tenant_id/wallet/topup", post(wallet::create_topup))
        .route("/wallet/packages", get(wallet::list_packages))
        .route(
            "/tenants/:tenant_id/billing/checkout",
            post(billing::create_checkout),
        )
        .route(
            "/tenants/:tenant_id/billing/subscription",
            get(billing::get_subscription),
        )
        .route(
            "/tenants/:tenant_id/billing/events",
            get(billing::list_events),
        );

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .nest("/api/v1", tenant_routes)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .with_state(state)
}
