//! Subscription billing endpoints

use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agendou_billing::CheckoutResponse;
use agendou_shared::{BillingCycle, Plan, Subscription, SubscriptionEvent};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: String,
    /// "mensal" or "anual"
    pub cycle: String,
}

/// POST /tenants/:tenant_id/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let plan = Plan::from_str(&request.plan).map_err(ApiError::Validation)?;
    let cycle = BillingCycle::from_str(&request.cycle).map_err(ApiError::Validation)?;

    let checkout = state
        .checkout
        .create_subscription_checkout(tenant_id, plan, cycle)
        .await?;
    Ok(Json(checkout))
}

#[derive(Serialize)]
pub struct SubscriptionResponse {
    pub subscription: Subscription,
}

/// GET /tenants/:tenant_id/billing/subscription
///
/// The tenant's most recent subscription, whatever its state
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionResponse>> {
    let subscription: Option<Subscription> = sqlx::query_as(
        r#"
        SELECT * FROM subscriptions
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&state.pool)
    .await?;

    let subscription = subscription.ok_or(ApiError::NotFound)?;
    Ok(Json(SubscriptionResponse { subscription }))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

/// GET /tenants/:tenant_id/billing/events
///
/// Audit trail for the tenant's most recent subscription
pub async fn list_events(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<SubscriptionEvent>>> {
    let subscription_id: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM subscriptions
        WHERE tenant_id = $1
        ORDER BY created_at DESC
        LIMIT 1
        "#,
    )
    .bind(tenant_id)
    .fetch_optional(&state.pool)
    .await?;

    let subscription_id = subscription_id.ok_or(ApiError::NotFound)?;
    let events = state
        .events
        .recent(subscription_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(events))
}
