//! Tenant wallet endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use agendou_billing::{CheckoutResponse, CreditPackage, CycleSummary, WalletSnapshot};
use agendou_shared::WalletTransaction;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /tenants/:tenant_id/wallet
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> ApiResult<Json<WalletSnapshot>> {
    let snapshot = state.wallet.snapshot(tenant_id).await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct StatementQuery {
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct StatementResponse {
    pub summary: CycleSummary,
    pub transactions: Vec<WalletTransaction>,
}

/// GET /tenants/:tenant_id/wallet/statement
pub async fn get_statement(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<StatementQuery>,
) -> ApiResult<Json<StatementResponse>> {
    let summary = state.statement.current_cycle_summary(tenant_id).await?;
    let transactions = state
        .statement
        .recent(tenant_id, query.limit.unwrap_or(50))
        .await?;
    Ok(Json(StatementResponse {
        summary,
        transactions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TopupRequest {
    pub package: String,
}

/// POST /tenants/:tenant_id/wallet/topup
pub async fn create_topup(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<TopupRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let package = CreditPackage::from_id(&request.package)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown credit package: {}", request.package)))?;

    let checkout = state.checkout.create_topup_checkout(tenant_id, package).await?;
    Ok(Json(checkout))
}

#[derive(Serialize)]
pub struct PackageInfo {
    pub id: &'static str,
    pub messages: i32,
    pub price_cents: i64,
    pub title: String,
}

/// GET /wallet/packages
pub async fn list_packages() -> Json<Vec<PackageInfo>> {
    let packages = CreditPackage::all()
        .into_iter()
        .map(|p| PackageInfo {
            id: p.id(),
            messages: p.messages(),
            price_cents: p.price_cents(),
            title: p.title(),
        })
        .collect();
    Json(packages)
}
