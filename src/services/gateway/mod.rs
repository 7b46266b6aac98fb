//! Outbound integrations: the payment gateway that collects money and the
//! goods provider that delivers the product.

pub mod digiflazz;
pub mod duitku;
pub mod signature;

use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use digiflazz::DigiflazzProvider;
pub use duitku::DuitkuGateway;

/// What the customer needs to complete a payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PaymentTarget {
    Url(String),
    VaNumber(String),
    QrString(String),
}

impl PaymentTarget {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentTarget::Url(v) | PaymentTarget::VaNumber(v) | PaymentTarget::QrString(v) => v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub order_id: String,
    pub amount: i64,
    pub method: String,
    pub product_details: String,
    pub customer_name: String,
    pub phone_number: String,
}

#[derive(Debug, Clone)]
pub struct ChargeResponse {
    pub payment_target: PaymentTarget,
    pub gateway_reference: Option<String>,
    pub status_code: String,
    pub status_message: String,
}

/// Payment result reported by the gateway callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentResult {
    Success,
    Pending,
    Failed,
}

impl PaymentResult {
    pub fn from_result_code(code: &str) -> Self {
        match code.trim() {
            "00" | "0" => PaymentResult::Success,
            "01" => PaymentResult::Pending,
            _ => PaymentResult::Failed,
        }
    }
}

/// Verified-or-not gateway callback fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCallback {
    pub merchant_code: String,
    pub order_id: String,
    pub amount: String,
    pub result_code: String,
    pub signature: String,
    pub reference: Option<String>,
    pub payment_code: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse, ServiceError>;

    /// Checks merchant code and signature. Must be called before any state
    /// is read for the callback.
    fn verify_callback_signature(&self, callback: &GatewayCallback) -> Result<(), ServiceError>;
}

/// Delivery status reported by the goods provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderStatus {
    Pending,
    Success,
    Failed,
}

impl ProviderStatus {
    /// Maps the provider's Indonesian status words; anything unrecognised is
    /// a failure.
    pub fn parse(status: &str) -> Self {
        let status = status.trim();
        if status.eq_ignore_ascii_case("pending") {
            ProviderStatus::Pending
        } else if status.eq_ignore_ascii_case("sukses") {
            ProviderStatus::Success
        } else {
            ProviderStatus::Failed
        }
    }
}

#[derive(Debug, Clone)]
pub struct FulfillmentRequest {
    pub provider_sku: String,
    pub destination: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResult {
    pub status: ProviderStatus,
    pub sn: Option<String>,
    /// Provider's cost for this transaction
    pub price: Option<i64>,
    pub message: Option<String>,
}

#[async_trait]
pub trait FulfillmentProvider: Send + Sync {
    async fn submit_fulfillment(
        &self,
        request: FulfillmentRequest,
    ) -> Result<FulfillmentResult, ServiceError>;

    /// Remaining deposit with the provider
    async fn check_balance(&self) -> Result<i64, ServiceError>;
}
