//! Applies gateway and provider callbacks to orders.
//!
//! Errors before the order is found are returned to the handler (400/404).
//! After that every outcome is acknowledged with HTTP 200 so the sender stops
//! retrying, and failures land in the order log instead.

use crate::{
    config::ReconciliationConfig,
    db::{begin_serializable, with_deadline, DbPool},
    entities::{
        ledger_entry::LedgerChangeType,
        order::{self, OrderStatus, OrderType},
    },
    errors::ServiceError,
    services::{
        accounts::AccountService,
        checkout::notification_for,
        gateway::{
            FulfillmentProvider, FulfillmentRequest, FulfillmentResult, GatewayCallback,
            PaymentGateway, PaymentResult, ProviderStatus,
        },
        ledger::{BalanceChange, LedgerService},
        notifications::NotificationDispatcher,
        orders::{OrderService, Transition},
    },
};
use metrics::counter;
use sea_orm::ConnectionTrait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Float(f64),
}

/// Accepts a string or a bare number; form bodies only ever carry strings.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(|v| match v {
        Scalar::Text(s) => s,
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => format!("{}", f),
    }))
}

/// Gateway callback body as sent, JSON or form-encoded
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCallbackPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub merchant_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub amount: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub merchant_order_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub product_detail: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub payment_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub result_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub reference: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub signature: Option<String>,
}

impl GatewayCallbackPayload {
    /// Checks that every signed field is present.
    pub fn into_callback(self) -> Result<GatewayCallback, ServiceError> {
        fn required(value: Option<String>, name: &str) -> Result<String, ServiceError> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ServiceError::MalformedCallback(format!("missing {}", name)))
        }

        Ok(GatewayCallback {
            merchant_code: required(self.merchant_code, "merchantCode")?,
            order_id: required(self.merchant_order_id, "merchantOrderId")?,
            amount: required(self.amount, "amount")?,
            result_code: required(self.result_code, "resultCode")?,
            signature: required(self.signature, "signature")?,
            reference: self.reference.filter(|r| !r.is_empty()),
            payment_code: self.payment_code.filter(|p| !p.is_empty()),
        })
    }
}

/// Acknowledgement returned to the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct CallbackAck {
    pub success: bool,
    pub message: String,
}

impl CallbackAck {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProviderCallbackData {
    pub ref_id: Option<String>,
    pub buyer_sku_code: Option<String>,
    pub customer_no: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub sn: Option<String>,
    pub price: Option<i64>,
}

/// Provider callback body
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct ProviderCallbackPayload {
    #[serde(default)]
    pub data: Option<ProviderCallbackData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProviderAckData {
    pub status: String,
    pub message: String,
    pub rc: String,
}

/// Acknowledgement in the provider's own envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ProviderAck {
    pub data: ProviderAckData,
}

impl ProviderAck {
    fn new(status: &str, message: impl Into<String>, rc: &str) -> Self {
        Self {
            data: ProviderAckData {
                status: status.to_string(),
                message: message.into(),
                rc: rc.to_string(),
            },
        }
    }

    pub fn processed() -> Self {
        Self::new("0", "Callback processed successfully", "00")
    }

    pub fn missing_parameters() -> Self {
        Self::new("2", "Terdapat parameter yang kosong", "07")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("2", message, "99")
    }
}

/// Customer-facing text for a gateway result code
pub fn gateway_status_message(result_code: &str) -> &'static str {
    match result_code.trim() {
        "00" | "0" => "Pembayaran Berhasil",
        "01" => "Pending",
        "03" => "Expired",
        _ => "Gagal",
    }
}

enum Processed {
    Applied(order::Model),
    Duplicate(order::Model),
    Noted,
    Ignored(order::Model),
    /// Success reported for an order that had already failed
    LateCapture(order::Model),
}

#[derive(Clone)]
pub struct CallbackReconciler {
    db: Arc<DbPool>,
    gateway: Arc<dyn PaymentGateway>,
    provider: Arc<dyn FulfillmentProvider>,
    notifications: NotificationDispatcher,
    orders: OrderService,
    ledger: LedgerService,
    accounts: AccountService,
    config: ReconciliationConfig,
}

impl CallbackReconciler {
    pub fn new(
        db: Arc<DbPool>,
        gateway: Arc<dyn PaymentGateway>,
        provider: Arc<dyn FulfillmentProvider>,
        notifications: NotificationDispatcher,
        orders: OrderService,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            provider,
            notifications,
            orders,
            ledger: LedgerService::new(),
            accounts: AccountService::new(),
            config,
        }
    }

    /// Gateway payment callback. `Err` only for malformed, unsigned or
    /// unknown-order callbacks.
    #[instrument(skip(self, payload), fields(order_id = ?payload.merchant_order_id, result_code = ?payload.result_code))]
    pub async fn handle_gateway_callback(
        &self,
        payload: GatewayCallbackPayload,
    ) -> Result<CallbackAck, ServiceError> {
        let callback = payload.into_callback().map_err(|e| {
            counter!("topup_callbacks.rejected", 1, "source" => "gateway", "reason" => "malformed");
            e
        })?;
        self.gateway
            .verify_callback_signature(&callback)
            .map_err(|e| {
                counter!("topup_callbacks.rejected", 1, "source" => "gateway", "reason" => "signature");
                warn!(error = %e, "gateway callback rejected");
                e
            })?;

        let order = self
            .orders
            .find_by_order_id(&*self.db, &callback.order_id)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(callback.order_id.clone()))?;

        if let Some(prefixed) = OrderType::from_order_id(&order.order_id) {
            if prefixed != order.order_type {
                warn!(stored = %order.order_type, %prefixed, "order id prefix disagrees with stored type");
            }
        }
        counter!("topup_callbacks.accepted", 1, "source" => "gateway");

        match self.process_gateway(&callback, &order).await {
            Ok(Processed::Applied(updated)) => {
                info!(status = %updated.status, "gateway callback applied");
                self.notifications.dispatch(notification_for(
                    &updated,
                    updated.provider_reference.clone(),
                ));
                Ok(CallbackAck::ok(format!("Order {} is {}", updated.order_id, updated.status)))
            }
            Ok(Processed::Duplicate(current)) => {
                info!(status = %current.status, "duplicate gateway callback");
                Ok(CallbackAck::ok(format!(
                    "Order {} already {}",
                    current.order_id, current.status
                )))
            }
            Ok(Processed::Noted) => Ok(CallbackAck::ok("Payment pending")),
            Ok(Processed::LateCapture(updated)) => {
                counter!("topup_callbacks.late_capture", 1);
                warn!(status = %updated.status, "payment captured for failed order");
                Ok(CallbackAck::ok(format!(
                    "Order {} already {}; late payment recorded",
                    updated.order_id, updated.status
                )))
            }
            Ok(Processed::Ignored(current)) => {
                warn!(status = %current.status, result_code = %callback.result_code, "stale result for advanced order ignored");
                Ok(CallbackAck::ok(format!(
                    "Order {} already {}",
                    current.order_id, current.status
                )))
            }
            Err(e) => {
                counter!("topup_callbacks.failed", 1, "source" => "gateway");
                error!(error = %e, "gateway callback processing failed");
                self.note_failure(&order.order_id, &format!("Callback error: {}", e))
                    .await;
                Ok(CallbackAck::failed(e.response_message()))
            }
        }
    }

    async fn process_gateway(
        &self,
        callback: &GatewayCallback,
        found: &order::Model,
    ) -> Result<Processed, ServiceError> {
        let paid_amount: i64 = callback.amount.parse().map_err(|_| {
            ServiceError::MalformedCallback(format!("amount {:?} is not an integer", callback.amount))
        })?;
        if paid_amount != found.final_amount {
            return Err(ServiceError::Conflict(format!(
                "paid amount {} does not match order amount {}",
                paid_amount, found.final_amount
            )));
        }

        let result = PaymentResult::from_result_code(&callback.result_code);
        let message = gateway_status_message(&callback.result_code);
        let db = &*self.db;

        let work = async {
            let txn = begin_serializable(db).await?;
            let order = self.orders.lock_by_order_id(&txn, &callback.order_id).await?;

            let processed = match result {
                PaymentResult::Pending if order.status == OrderStatus::Pending => {
                    self.orders
                        .note_payment_status(&txn, &order.order_id, message)
                        .await?;
                    Processed::Noted
                }
                PaymentResult::Pending => Processed::Ignored(order),
                PaymentResult::Failed if order.status == OrderStatus::Pending => {
                    let reason = format!("Payment {} (code {})", message, callback.result_code);
                    Processed::Applied(
                        self.orders
                            .mark_failed(&txn, &order, &reason)
                            .await?
                            .into_order(),
                    )
                }
                PaymentResult::Failed => Processed::Ignored(order),
                PaymentResult::Success if order.status == OrderStatus::Failed => {
                    match self
                        .orders
                        .capture_after_failure(&txn, &order, callback.reference.clone(), message)
                        .await?
                    {
                        Transition::Applied(updated) => Processed::LateCapture(updated),
                        Transition::Unchanged(current) => Processed::Duplicate(current),
                    }
                }
                PaymentResult::Success if order.status != OrderStatus::Pending => {
                    Processed::Duplicate(order)
                }
                PaymentResult::Success => {
                    let paid = self
                        .orders
                        .mark_paid(&txn, &order, callback.reference.clone(), message)
                        .await?
                        .into_order();
                    let settled = match paid.order_type {
                        OrderType::Purchase => self.fulfil(&txn, paid).await?,
                        OrderType::Deposit => self.credit_deposit(&txn, paid).await?,
                        OrderType::Membership => self.apply_membership(&txn, paid).await?,
                    };
                    Processed::Applied(settled)
                }
            };

            txn.commit().await?;
            Ok::<_, ServiceError>(processed)
        };

        with_deadline(self.config.callback_timeout(), "gateway callback", work).await
    }

    /// Submits a paid purchase to the provider. A transport failure leaves the
    /// order PAID for the provider callback to settle.
    async fn fulfil<C: ConnectionTrait>(
        &self,
        txn: &C,
        paid: order::Model,
    ) -> Result<order::Model, ServiceError> {
        let request = FulfillmentRequest {
            provider_sku: paid.provider_sku.clone().unwrap_or_default(),
            destination: paid.buyer_reference.clone(),
            reference: paid.order_id.clone(),
        };
        match self.provider.submit_fulfillment(request).await {
            Ok(result) => Ok(self
                .orders
                .mark_fulfillment_result(txn, &paid, &result)
                .await?
                .into_order()),
            Err(e) => {
                warn!(error = %e, "provider submission failed; awaiting provider callback");
                self.orders
                    .append_note(txn, &paid.order_id, &format!("Provider submission failed: {}", e))
                    .await?;
                self.orders
                    .find_by_order_id(txn, &paid.order_id)
                    .await?
                    .ok_or_else(|| ServiceError::OrderNotFound(paid.order_id.clone()))
            }
        }
    }

    async fn credit_deposit<C: ConnectionTrait>(
        &self,
        txn: &C,
        paid: order::Model,
    ) -> Result<order::Model, ServiceError> {
        let username = paid.username.clone().ok_or_else(|| {
            ServiceError::InternalError(format!("deposit {} has no account", paid.order_id))
        })?;
        let credit = self
            .orders
            .fees()
            .net_of_fee(&paid.payment_method, paid.final_amount);
        self.ledger
            .apply_delta(
                txn,
                BalanceChange {
                    username: &username,
                    delta: credit,
                    change_type: LedgerChangeType::Deposit,
                    description: format!("Deposit {} via {}", paid.order_id, paid.payment_method),
                    order_ref: Some(&paid.order_id),
                },
            )
            .await?;
        counter!("topup_ledger.deposits", 1);
        self.orders
            .append_note(txn, &paid.order_id, &format!("Credited {} to balance", credit))
            .await?;
        Ok(paid)
    }

    async fn apply_membership<C: ConnectionTrait>(
        &self,
        txn: &C,
        paid: order::Model,
    ) -> Result<order::Model, ServiceError> {
        let username = paid.username.clone().ok_or_else(|| {
            ServiceError::InternalError(format!("membership {} has no account", paid.order_id))
        })?;

        if paid.final_amount >= self.config.platinum_threshold
            && self.accounts.upgrade_to_platinum(txn, &username).await?
        {
            self.orders
                .append_note(txn, &paid.order_id, "Membership upgraded to PLATINUM")
                .await?;
            return Ok(paid);
        }

        let credit = self
            .orders
            .fees()
            .net_of_fee(&paid.payment_method, paid.final_amount);
        self.ledger
            .apply_delta(
                txn,
                BalanceChange {
                    username: &username,
                    delta: credit,
                    change_type: LedgerChangeType::Deposit,
                    description: format!(
                        "Membership {} credited to balance via {}",
                        paid.order_id, paid.payment_method
                    ),
                    order_ref: Some(&paid.order_id),
                },
            )
            .await?;
        self.orders
            .append_note(
                txn,
                &paid.order_id,
                &format!("No upgrade applied; credited {} to balance", credit),
            )
            .await?;
        Ok(paid)
    }

    /// Provider delivery callback. Always answers in the provider envelope.
    #[instrument(skip(self, payload))]
    pub async fn handle_provider_callback(&self, payload: ProviderCallbackPayload) -> ProviderAck {
        let data = payload.data.unwrap_or_default();
        let present = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let (Some(ref_id), Some(sku), Some(_customer)) = (
            present(&data.ref_id),
            present(&data.buyer_sku_code),
            present(&data.customer_no),
        ) else {
            counter!("topup_callbacks.rejected", 1, "source" => "provider", "reason" => "malformed");
            return ProviderAck::missing_parameters();
        };
        counter!("topup_callbacks.accepted", 1, "source" => "provider");

        let result = FulfillmentResult {
            status: ProviderStatus::parse(data.status.as_deref().unwrap_or_default()),
            sn: data.sn.filter(|sn| !sn.trim().is_empty()),
            price: data.price,
            message: data.message,
        };

        match self.process_provider(&ref_id, &sku, &result).await {
            Ok(Transition::Applied(updated)) => {
                info!(order_id = %ref_id, status = %updated.status, "provider callback applied");
                self.notifications.dispatch(notification_for(
                    &updated,
                    updated.provider_reference.clone(),
                ));
                ProviderAck::processed()
            }
            Ok(Transition::Unchanged(_)) => ProviderAck::processed(),
            Err(e) => {
                counter!("topup_callbacks.failed", 1, "source" => "provider");
                error!(order_id = %ref_id, error = %e, "provider callback processing failed");
                if !matches!(e, ServiceError::OrderNotFound(_)) {
                    self.note_failure(&ref_id, &format!("Provider callback error: {}", e))
                        .await;
                }
                ProviderAck::error(e.response_message())
            }
        }
    }

    async fn process_provider(
        &self,
        ref_id: &str,
        sku: &str,
        result: &FulfillmentResult,
    ) -> Result<Transition, ServiceError> {
        let db = &*self.db;
        let work = async {
            let txn = begin_serializable(db).await?;
            let order = self.orders.lock_by_order_id(&txn, ref_id).await?;
            if order.order_type != OrderType::Purchase {
                return Err(ServiceError::ValidationError(format!(
                    "{} is not a purchase order",
                    ref_id
                )));
            }
            match order.status {
                OrderStatus::Paid | OrderStatus::Process => {}
                status if status.is_terminal() => {
                    info!(order_id = %ref_id, %status, "provider callback for settled order");
                    return Ok(Transition::Unchanged(order));
                }
                status => {
                    counter!("topup_callbacks.rejected", 1, "source" => "provider", "reason" => "unpaid");
                    return Err(ServiceError::Conflict(format!(
                        "order {} is {} and not awaiting fulfillment",
                        ref_id, status
                    )));
                }
            }
            if order.provider_sku.as_deref() != Some(sku) {
                warn!(expected = ?order.provider_sku, reported = sku, "provider sku mismatch");
            }
            let transition = self
                .orders
                .mark_fulfillment_result(&txn, &order, result)
                .await?;
            txn.commit().await?;
            Ok::<_, ServiceError>(transition)
        };
        with_deadline(self.config.callback_timeout(), "provider callback", work).await
    }

    async fn note_failure(&self, order_id: &str, note: &str) {
        if let Err(e) = self.orders.append_note(&*self.db, order_id, note).await {
            error!(%order_id, error = %e, "could not record callback failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn json_amounts_may_be_numbers() {
        let payload: GatewayCallbackPayload = serde_json::from_value(json!({
            "merchantCode": "D0001",
            "amount": 50000,
            "merchantOrderId": "VAZ-1-abcdef",
            "resultCode": "00",
            "signature": "abc"
        }))
        .unwrap();
        let callback = payload.into_callback().unwrap();
        assert_eq!(callback.amount, "50000");
    }

    #[test]
    fn missing_signed_field_is_malformed() {
        let payload = GatewayCallbackPayload {
            merchant_code: Some("D0001".into()),
            amount: Some("50000".into()),
            merchant_order_id: Some("VAZ-1".into()),
            result_code: Some("00".into()),
            signature: Some("   ".into()),
            ..Default::default()
        };
        assert_matches!(
            payload.into_callback(),
            Err(ServiceError::MalformedCallback(msg)) if msg.contains("signature")
        );
    }

    #[test]
    fn provider_acks_use_provider_codes() {
        assert_eq!(ProviderAck::processed().data.rc, "00");
        assert_eq!(ProviderAck::missing_parameters().data.rc, "07");
        assert_eq!(ProviderAck::missing_parameters().data.status, "2");
        assert_eq!(ProviderAck::error("boom").data.rc, "99");
    }

    #[test]
    fn result_code_messages() {
        assert_eq!(gateway_status_message("00"), "Pembayaran Berhasil");
        assert_eq!(gateway_status_message("01"), "Pending");
        assert_eq!(gateway_status_message("02"), "Gagal");
        assert_eq!(gateway_status_message("03"), "Expired");
    }
}
