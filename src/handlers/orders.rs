use axum::{
    extract::{Path, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    entities::{
        order::{self, OrderStatus, OrderType},
        payment::{self, PaymentStatus},
    },
    errors::ServiceError,
    ApiResponse, AppState,
};

/// Public view of an order, as shown on the invoice page
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderView {
    pub merchant_order_id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub product_name: Option<String>,
    pub buyer_reference: String,
    pub charge_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub provider_reference: Option<String>,
    pub payment: PaymentView,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentView {
    pub method: String,
    pub status: PaymentStatus,
    pub amount_due: i64,
    pub payment_target: Option<String>,
    pub status_message: Option<String>,
}

impl OrderView {
    fn new(order: order::Model, payment: payment::Model) -> Self {
        Self {
            merchant_order_id: order.order_id,
            order_type: order.order_type,
            status: order.status,
            product_name: order.product_name,
            buyer_reference: order.buyer_reference,
            charge_amount: order.charge_amount,
            discount_amount: order.discount_amount,
            final_amount: order.final_amount,
            provider_reference: order.provider_reference,
            payment: PaymentView {
                method: payment.method,
                status: payment.status,
                amount_due: payment.amount_due,
                payment_target: payment.payment_target,
                status_message: payment.status_message,
            },
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// Poll an order's status
#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    summary = "Get order",
    params(("order_id" = String, Path, description = "Merchant order id, e.g. VAZ-1717171717171-3fa9c2")),
    responses(
        (status = 200, description = "Order found", body = ApiResponse<OrderView>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<ApiResponse<OrderView>>, ServiceError> {
    let orders = &state.services.orders;
    let order = orders
        .find_by_order_id(&*state.db, &order_id)
        .await?
        .ok_or_else(|| ServiceError::OrderNotFound(order_id.clone()))?;
    let payment = orders.payment_for(&*state.db, &order_id).await?;
    Ok(Json(ApiResponse::success(OrderView::new(order, payment))))
}
