//! Topup API
//!
//! Payment and fulfillment reconciliation core for a digital goods top-up
//! storefront: tiered pricing, vouchers, a balance ledger, gateway charges and
//! idempotent gateway/provider callbacks.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod middleware_helpers;
pub mod migrator;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub services: services::AppServices,
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            meta: Some(ResponseMeta::capture()),
        }
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-err"), async {
                ApiResponse::<()>::error("oops".into())
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-err"));
        assert_eq!(response.message.as_deref(), Some("oops"));
    }
}

/// Routes under `/api/v1`
pub fn api_v1_routes() -> Router<AppState> {
    let checkout = Router::new()
        .route("/checkout", post(handlers::checkout::create_checkout))
        .route("/deposits", post(handlers::checkout::create_deposit))
        .route("/memberships", post(handlers::checkout::create_membership))
        .route("/vouchers/check", post(handlers::checkout::check_voucher));

    // Unauthenticated; the gateway callback is signature-verified
    let callbacks = Router::new()
        .route("/callbacks/duitku", post(handlers::callbacks::gateway_callback))
        .route(
            "/callbacks/digiflazz",
            post(handlers::callbacks::provider_callback),
        );

    let accounts = Router::new()
        .route("/orders/:order_id", get(handlers::orders::get_order))
        .route("/balance", get(handlers::balance::get_balance))
        .route(
            "/balance/history",
            get(handlers::balance::get_balance_history),
        );

    Router::new()
        .route("/status", get(handlers::health::api_status))
        .merge(checkout)
        .merge(callbacks)
        .merge(accounts)
}

/// Full application router without transport middleware
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .nest("/api/v1", api_v1_routes())
        .merge(openapi::swagger_ui())
        .with_state(state)
}
