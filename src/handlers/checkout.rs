use axum::{extract::State, http::StatusCode, response::Json};

use crate::{
    errors::ServiceError,
    middleware_helpers::Caller,
    services::checkout::{
        CheckoutResponse, PurchaseRequest, TopUpRequest, VoucherCheckRequest, VoucherPreview,
    },
    ApiResponse, AppState,
};

/// Create a product checkout
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    summary = "Create checkout",
    description = "Prices the product for the caller's tier, redeems an optional voucher and either creates a gateway charge or settles from the account balance (payment_method = SALDO)",
    request_body = PurchaseRequest,
    params(("x-user" = Option<String>, Header, description = "Username forwarded by the session layer; absent for guests")),
    responses(
        (status = 201, description = "Checkout created", body = ApiResponse<CheckoutResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Invalid request, voucher rejected or insufficient balance", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway error", body = crate::errors::ErrorResponse),
        (status = 504, description = "Checkout timed out", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn create_checkout(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResponse>>), ServiceError> {
    let response = state.services.checkout.purchase(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// Create a balance deposit
#[utoipa::path(
    post,
    path = "/api/v1/deposits",
    summary = "Create deposit",
    request_body = TopUpRequest,
    params(("x-user" = String, Header, description = "Username forwarded by the session layer")),
    responses(
        (status = 201, description = "Deposit charge created", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway error", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn create_deposit(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<TopUpRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResponse>>), ServiceError> {
    let response = state.services.checkout.deposit(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// Create a membership payment
#[utoipa::path(
    post,
    path = "/api/v1/memberships",
    summary = "Create membership payment",
    description = "Payments at or above the platinum threshold upgrade a regular account once confirmed; anything else is credited to the balance",
    request_body = TopUpRequest,
    params(("x-user" = String, Header, description = "Username forwarded by the session layer")),
    responses(
        (status = 201, description = "Membership charge created", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway error", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn create_membership(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<TopUpRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutResponse>>), ServiceError> {
    let response = state.services.checkout.membership(&caller, request).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// Preview a voucher
#[utoipa::path(
    post,
    path = "/api/v1/vouchers/check",
    summary = "Check voucher",
    description = "Computes the discount for a product without consuming the voucher",
    request_body = VoucherCheckRequest,
    responses(
        (status = 200, description = "Voucher applies", body = ApiResponse<VoucherPreview>),
        (status = 400, description = "Voucher invalid, exhausted or not applicable", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Checkout"
)]
pub async fn check_voucher(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<VoucherCheckRequest>,
) -> Result<Json<ApiResponse<VoucherPreview>>, ServiceError> {
    let preview = state
        .services
        .checkout
        .preview_voucher(&caller, request)
        .await?;
    Ok(Json(ApiResponse::success(preview)))
}
