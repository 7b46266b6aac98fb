use crate::{
    entities::{
        ledger_entry::LedgerChangeType,
        order::{self, Entity as OrderEntity, OrderStatus, OrderType},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
    },
    errors::ServiceError,
    services::{
        fees::FeePolicy,
        gateway::{FulfillmentResult, ProviderStatus},
        ledger::{BalanceChange, LedgerService},
        vouchers::VoucherService,
    },
};
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter,
    QuerySelect, Set,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Mints a merchant order id such as `VAZ-1717171717171-3fa9c2`.
pub fn mint_order_id(order_type: OrderType, now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        order_type.prefix(),
        now.timestamp_millis(),
        &suffix[..6]
    )
}

/// Appends a timestamped line to an order log.
fn append_log(existing: Option<&str>, line: &str, now: DateTime<Utc>) -> String {
    let stamped = format!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S"), line);
    match existing {
        Some(log) if !log.is_empty() => format!("{}\n{}", log, stamped),
        _ => stamped,
    }
}

/// Fields for a freshly created order and its payment row
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_id: String,
    pub order_type: OrderType,
    pub product_ref: Option<String>,
    pub product_name: Option<String>,
    pub provider_sku: Option<String>,
    pub buyer_reference: String,
    pub customer_phone: Option<String>,
    pub username: Option<String>,
    pub voucher_id: Option<Uuid>,
    pub charge_amount: i64,
    pub discount_amount: i64,
    pub final_amount: i64,
    pub expected_profit: i64,
    pub payment_method: String,
    pub fee: i64,
}

/// Result of a state machine operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The order moved; carries the new state
    Applied(order::Model),
    /// Nothing to do; carries the stored state
    Unchanged(order::Model),
}

impl Transition {
    pub fn order(&self) -> &order::Model {
        match self {
            Transition::Applied(o) | Transition::Unchanged(o) => o,
        }
    }

    pub fn into_order(self) -> order::Model {
        match self {
            Transition::Applied(o) | Transition::Unchanged(o) => o,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Order and payment state machine. Every operation runs on the caller's
/// transaction and keeps the order and payment rows in step.
#[derive(Debug, Clone)]
pub struct OrderService {
    fees: FeePolicy,
    ledger: LedgerService,
    vouchers: VoucherService,
}

impl OrderService {
    pub fn new(fees: FeePolicy) -> Self {
        Self {
            fees,
            ledger: LedgerService::new(),
            vouchers: VoucherService::new(),
        }
    }

    pub fn fees(&self) -> &FeePolicy {
        &self.fees
    }

    /// Inserts a PENDING order and its PENDING payment.
    #[instrument(skip(self, txn, new), fields(order_id = %new.order_id, order_type = %new.order_type))]
    pub async fn create_pending<C: ConnectionTrait>(
        &self,
        txn: &C,
        new: NewOrder,
    ) -> Result<order::Model, ServiceError> {
        let order = self
            .insert(txn, new, OrderStatus::Pending, PaymentStatus::Pending, None)
            .await?;
        counter!("topup_orders.created", 1, "order_type" => order.order_type.to_string());
        Ok(order)
    }

    /// Records an order whose charge could not be created. Runs after the
    /// checkout transaction rolled back, so the voucher was never consumed.
    pub async fn record_failed_checkout<C: ConnectionTrait>(
        &self,
        txn: &C,
        new: NewOrder,
        reason: &str,
    ) -> Result<order::Model, ServiceError> {
        let order_id = new.order_id.clone();
        let order = self
            .insert(
                txn,
                NewOrder {
                    voucher_id: None,
                    ..new
                },
                OrderStatus::Failed,
                PaymentStatus::Failed,
                Some(reason),
            )
            .await?;
        counter!("topup_orders.checkout_failed", 1);
        warn!(%order_id, reason, "checkout recorded as failed");
        Ok(order)
    }

    async fn insert<C: ConnectionTrait>(
        &self,
        txn: &C,
        new: NewOrder,
        status: OrderStatus,
        payment_status: PaymentStatus,
        note: Option<&str>,
    ) -> Result<order::Model, ServiceError> {
        let now = Utc::now();
        let log = note.map(|n| append_log(None, n, now));

        payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(new.order_id.clone()),
            method: Set(new.payment_method.clone()),
            amount_due: Set(new.final_amount),
            fee: Set(new.fee),
            status: Set(payment_status),
            external_reference: Set(None),
            payment_target: Set(None),
            status_message: Set(note.map(str::to_string)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        let order = order::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(new.order_id),
            order_type: Set(new.order_type),
            product_ref: Set(new.product_ref),
            product_name: Set(new.product_name),
            provider_sku: Set(new.provider_sku),
            buyer_reference: Set(new.buyer_reference),
            customer_phone: Set(new.customer_phone),
            username: Set(new.username),
            voucher_id: Set(new.voucher_id),
            charge_amount: Set(new.charge_amount),
            discount_amount: Set(new.discount_amount),
            final_amount: Set(new.final_amount),
            expected_profit: Set(new.expected_profit),
            purchase_price: Set(None),
            profit_amount: Set(None),
            payment_method: Set(new.payment_method),
            status: Set(status),
            provider_reference: Set(None),
            log: Set(log),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;
        Ok(order)
    }

    pub async fn find_by_order_id<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: &str,
    ) -> Result<Option<order::Model>, ServiceError> {
        Ok(OrderEntity::find()
            .filter(order::Column::OrderId.eq(order_id))
            .one(conn)
            .await?)
    }

    /// Reads the order under an exclusive row lock.
    pub async fn lock_by_order_id<C: ConnectionTrait>(
        &self,
        txn: &C,
        order_id: &str,
    ) -> Result<order::Model, ServiceError> {
        OrderEntity::find()
            .filter(order::Column::OrderId.eq(order_id))
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))
    }

    pub async fn payment_for<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: &str,
    ) -> Result<payment::Model, ServiceError> {
        PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment for {}", order_id)))
    }

    /// Stores what the gateway returned for a new charge.
    pub async fn attach_charge<C: ConnectionTrait>(
        &self,
        txn: &C,
        order_id: &str,
        payment_target: &str,
        external_reference: Option<String>,
        status_message: &str,
    ) -> Result<payment::Model, ServiceError> {
        let mut active = self.payment_for(txn, order_id).await?.into_active_model();
        active.payment_target = Set(Some(payment_target.to_string()));
        active.external_reference = Set(external_reference);
        active.status_message = Set(Some(status_message.to_string()));
        active.updated_at = Set(Utc::now());
        Ok(active.update(txn).await?)
    }

    /// Records an intermediate gateway status without moving the order.
    pub async fn note_payment_status<C: ConnectionTrait>(
        &self,
        txn: &C,
        order_id: &str,
        status_message: &str,
    ) -> Result<(), ServiceError> {
        let mut active = self.payment_for(txn, order_id).await?.into_active_model();
        active.status_message = Set(Some(status_message.to_string()));
        active.updated_at = Set(Utc::now());
        active.update(txn).await?;
        Ok(())
    }

    /// PENDING -> PAID. An order that is already past PENDING is returned
    /// unchanged.
    #[instrument(skip(self, txn, order), fields(order_id = %order.order_id, status = %order.status))]
    pub async fn mark_paid<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        external_reference: Option<String>,
        status_message: &str,
    ) -> Result<Transition, ServiceError> {
        if order.status != OrderStatus::Pending {
            return Ok(Transition::Unchanged(order.clone()));
        }

        let now = Utc::now();
        let mut payment = self
            .payment_for(txn, &order.order_id)
            .await?
            .into_active_model();
        payment.status = Set(PaymentStatus::Paid);
        if external_reference.is_some() {
            payment.external_reference = Set(external_reference);
        }
        payment.status_message = Set(Some(status_message.to_string()));
        payment.updated_at = Set(now);
        payment.update(txn).await?;

        let updated = self
            .move_to(
                txn,
                order,
                OrderStatus::Paid,
                &format!("Payment received via {}", order.payment_method),
                now,
            )
            .await?;
        counter!("topup_orders.paid", 1, "order_type" => order.order_type.to_string());
        Ok(Transition::Applied(updated))
    }

    /// Applies the provider's delivery status. A FAILED delivery runs the
    /// refund path.
    #[instrument(skip(self, txn, order, result), fields(order_id = %order.order_id, status = %order.status, provider_status = %result.status))]
    pub async fn mark_fulfillment_result<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        result: &FulfillmentResult,
    ) -> Result<Transition, ServiceError> {
        let target = match result.status {
            ProviderStatus::Pending => OrderStatus::Process,
            ProviderStatus::Success => OrderStatus::Success,
            ProviderStatus::Failed => OrderStatus::Failed,
        };

        if order.status == target {
            return Ok(Transition::Unchanged(order.clone()));
        }
        if !order.status.can_transition_to(target) {
            if order.status.is_terminal() {
                warn!(
                    stored = %order.status,
                    reported = %target,
                    "provider result conflicts with terminal order; ignoring"
                );
                return Ok(Transition::Unchanged(order.clone()));
            }
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: target.to_string(),
            });
        }

        counter!("topup_fulfillment.results", 1, "status" => result.status.to_string());
        let message = result.message.as_deref().unwrap_or("-");

        match target {
            OrderStatus::Failed => {
                self.fail(txn, order, &format!("Provider failed: {}", message))
                    .await
            }
            OrderStatus::Process => {
                let updated = self
                    .move_to(
                        txn,
                        order,
                        OrderStatus::Process,
                        &format!("Provider processing: {}", message),
                        Utc::now(),
                    )
                    .await?;
                Ok(Transition::Applied(updated))
            }
            _ => {
                let now = Utc::now();
                let mut active = order.clone().into_active_model();
                active.status = Set(OrderStatus::Success);
                active.provider_reference = Set(result.sn.clone().filter(|sn| !sn.is_empty()));
                active.purchase_price = Set(result.price);
                active.profit_amount = Set(result.price.map(|price| order.final_amount - price));
                active.log = Set(Some(append_log(
                    order.log.as_deref(),
                    &format!(
                        "Delivered. SN: {}",
                        result.sn.as_deref().unwrap_or("-")
                    ),
                    now,
                )));
                active.updated_at = Set(now);
                let updated = active.update(txn).await?;
                info!(sn = ?updated.provider_reference, profit = ?updated.profit_amount, "order fulfilled");
                Ok(Transition::Applied(updated))
            }
        }
    }

    /// PENDING/PAID/PROCESS -> FAILED with compensation. Failing an already
    /// FAILED order is a no-op; a SUCCESS order cannot fail.
    #[instrument(skip(self, txn, order), fields(order_id = %order.order_id, status = %order.status))]
    pub async fn mark_failed<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        reason: &str,
    ) -> Result<Transition, ServiceError> {
        if order.status == OrderStatus::Failed {
            return Ok(Transition::Unchanged(order.clone()));
        }
        if !order.status.can_transition_to(OrderStatus::Failed) {
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::Failed.to_string(),
            });
        }
        self.fail(txn, order, reason).await
    }

    /// Best-effort note on an order; used when a callback errors after lookup.
    pub async fn append_note<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: &str,
        note: &str,
    ) -> Result<(), ServiceError> {
        let Some(order) = self.find_by_order_id(conn, order_id).await? else {
            return Ok(());
        };
        let now = Utc::now();
        let mut active = order.clone().into_active_model();
        active.log = Set(Some(append_log(order.log.as_deref(), note, now)));
        active.updated_at = Set(now);
        active.update(conn).await?;
        Ok(())
    }

    async fn fail<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        reason: &str,
    ) -> Result<Transition, ServiceError> {
        let now = Utc::now();
        let payment = self.payment_for(txn, &order.order_id).await?;
        let captured = payment.status == PaymentStatus::Paid;
        let mut notes = vec![reason.to_string()];

        let mut payment_active = payment.clone().into_active_model();
        payment_active.updated_at = Set(now);

        if captured {
            let (note, message) = self.refund_captured(txn, order, &payment.method).await?;
            notes.push(note);
            if let Some(message) = message {
                payment_active.status_message = Set(Some(message));
            }
        } else {
            payment_active.status = Set(PaymentStatus::Failed);
            payment_active.status_message = Set(Some(reason.to_string()));
        }
        payment_active.update(txn).await?;

        if let Some(voucher_id) = order.voucher_id {
            self.vouchers.release(txn, voucher_id, now).await?;
            notes.push("Voucher use released".to_string());
        }

        let updated = self
            .move_to(txn, order, OrderStatus::Failed, &notes.join(". "), now)
            .await?;
        counter!("topup_orders.failed", 1, "order_type" => order.order_type.to_string());
        Ok(Transition::Applied(updated))
    }

    /// Payment captured for an order that already FAILED (late gateway
    /// success). The payment becomes PAID and the money goes back to the
    /// buyer; the order stays FAILED. A payment that is already PAID was
    /// handled before and is returned unchanged.
    #[instrument(skip(self, txn, order), fields(order_id = %order.order_id))]
    pub async fn capture_after_failure<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        external_reference: Option<String>,
        status_message: &str,
    ) -> Result<Transition, ServiceError> {
        if order.status != OrderStatus::Failed {
            return Err(ServiceError::InvalidTransition {
                from: order.status.to_string(),
                to: OrderStatus::Failed.to_string(),
            });
        }
        let payment = self.payment_for(txn, &order.order_id).await?;
        if payment.status == PaymentStatus::Paid {
            return Ok(Transition::Unchanged(order.clone()));
        }

        let now = Utc::now();
        let (note, message) = self.refund_captured(txn, order, &payment.method).await?;
        let method = payment.method.clone();
        let mut active = payment.into_active_model();
        active.status = Set(PaymentStatus::Paid);
        if external_reference.is_some() {
            active.external_reference = Set(external_reference);
        }
        active.status_message = Set(Some(message.unwrap_or_else(|| status_message.to_string())));
        active.updated_at = Set(now);
        active.update(txn).await?;

        let mut order_active = order.clone().into_active_model();
        order_active.log = Set(Some(append_log(
            order.log.as_deref(),
            &format!("Payment received via {} after order failed. {}", method, note),
            now,
        )));
        order_active.updated_at = Set(now);
        let updated = order_active.update(txn).await?;
        Ok(Transition::Applied(updated))
    }

    /// Returns captured funds to the buyer's balance. Gives the order log note
    /// and, when the payment message should change, the new message.
    async fn refund_captured<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        method: &str,
    ) -> Result<(String, Option<String>), ServiceError> {
        let refund = self.fees.net_of_fee(method, order.final_amount);
        match order.username.as_deref() {
            Some(username) if refund > 0 => {
                self.ledger
                    .apply_delta(
                        txn,
                        BalanceChange {
                            username,
                            delta: refund,
                            change_type: LedgerChangeType::Refund,
                            description: format!("Refund {}", order.order_id),
                            order_ref: Some(&order.order_id),
                        },
                    )
                    .await?;
                counter!("topup_ledger.refunds", 1);
                Ok((
                    format!("Refunded {} to balance", refund),
                    Some(format!("Refunded {}", refund)),
                ))
            }
            Some(_) => Ok(("Nothing to refund".to_string(), None)),
            None => {
                counter!("topup_ledger.refunds_unresolved", 1);
                warn!(refund, "guest order failed after payment; refund needs manual handling");
                Ok((
                    format!(
                        "Refund of {} not credited: guest order, manual handling required",
                        refund
                    ),
                    Some("Refund pending".to_string()),
                ))
            }
        }
    }

    async fn move_to<C: ConnectionTrait>(
        &self,
        txn: &C,
        order: &order::Model,
        next: OrderStatus,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<order::Model, ServiceError> {
        let mut active = order.clone().into_active_model();
        active.status = Set(next);
        active.log = Set(Some(append_log(order.log.as_deref(), note, now)));
        active.updated_at = Set(now);
        let updated = active.update(txn).await?;
        info!(from = %order.status, to = %next, "order status changed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn minted_ids_carry_type_prefix() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let id = mint_order_id(OrderType::Purchase, now);
        assert!(id.starts_with(&format!("VAZ-{}-", now.timestamp_millis())));
        assert_eq!(OrderType::from_order_id(&id), Some(OrderType::Purchase));
        assert_eq!(id.rsplit('-').next().map(str::len), Some(6));

        let dep = mint_order_id(OrderType::Deposit, now);
        assert_eq!(OrderType::from_order_id(&dep), Some(OrderType::Deposit));
        assert_ne!(dep, mint_order_id(OrderType::Deposit, now));
    }

    #[test]
    fn log_lines_are_appended() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let first = append_log(None, "created", now);
        assert_eq!(first, "[2024-06-01 08:30:00] created");
        let second = append_log(Some(&first), "paid", now);
        assert_eq!(second.lines().count(), 2);
        assert!(second.ends_with("paid"));
    }
}
