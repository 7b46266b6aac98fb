use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::{
    entities::{ledger_entry, user::MembershipTier},
    errors::ServiceError,
    middleware_helpers::Caller,
    ApiResponse, AppState,
};

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BalanceView {
    pub username: String,
    pub tier: MembershipTier,
    pub balance: i64,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Maximum entries to return, oldest first (default 100, max 500)
    pub limit: Option<u64>,
}

fn require_user(caller: &Caller) -> Result<&str, ServiceError> {
    caller.username().ok_or_else(|| {
        ServiceError::ValidationError("balance requires a signed-in account".to_string())
    })
}

/// Caller's balance
#[utoipa::path(
    get,
    path = "/api/v1/balance",
    summary = "Get balance",
    params(("x-user" = String, Header, description = "Username forwarded by the session layer")),
    responses(
        (status = 200, description = "Current balance", body = ApiResponse<BalanceView>),
        (status = 400, description = "No caller", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown account", body = crate::errors::ErrorResponse),
    ),
    tag = "Balance"
)]
pub async fn get_balance(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ApiResponse<BalanceView>>, ServiceError> {
    let username = require_user(&caller)?;
    let user = state.services.accounts.require(&*state.db, username).await?;
    Ok(Json(ApiResponse::success(BalanceView {
        username: user.username,
        tier: user.tier,
        balance: user.balance,
    })))
}

/// Caller's ledger
#[utoipa::path(
    get,
    path = "/api/v1/balance/history",
    summary = "Balance history",
    params(
        ("x-user" = String, Header, description = "Username forwarded by the session layer"),
        HistoryQuery
    ),
    responses(
        (status = 200, description = "Ledger entries, oldest first", body = ApiResponse<Vec<ledger_entry::Model>>),
        (status = 400, description = "No caller", body = crate::errors::ErrorResponse),
    ),
    tag = "Balance"
)]
pub async fn get_balance_history(
    State(state): State<AppState>,
    caller: Caller,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<ledger_entry::Model>>>, ServiceError> {
    let username = require_user(&caller)?;
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let entries = state
        .services
        .ledger
        .history(&*state.db, username, Some(limit))
        .await?;
    Ok(Json(ApiResponse::success(entries)))
}
