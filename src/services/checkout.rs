use crate::{
    db::{begin_serializable, with_deadline, DbPool},
    entities::{
        ledger_entry::LedgerChangeType,
        order::{self, OrderStatus, OrderType},
        payment::SALDO,
    },
    errors::ServiceError,
    middleware_helpers::Caller,
    services::{
        accounts::AccountService,
        gateway::{
            ChargeRequest, FulfillmentProvider, FulfillmentRequest, PaymentGateway, PaymentTarget,
        },
        ledger::{BalanceChange, LedgerService},
        notifications::{NotificationDispatcher, OrderNotification},
        orders::{mint_order_id, NewOrder, OrderService},
        pricing::CatalogLookup,
        purchase_lock::{PurchaseKey, PurchaseLocks},
        vouchers::{Redemption, VoucherService},
    },
};
use chrono::Utc;
use metrics::counter;
use sea_orm::ConnectionTrait;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

/// Product purchase request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct PurchaseRequest {
    #[validate(length(min = 1, max = 64))]
    pub product_ref: String,
    /// Gateway method code, or `SALDO` to pay from the account balance
    #[validate(length(min = 1, max = 16))]
    pub payment_method: String,
    /// Game account id, phone number or meter id
    #[validate(length(min = 1, max = 64))]
    pub buyer_reference: String,
    #[validate(length(max = 32))]
    pub server_id: Option<String>,
    #[validate(length(min = 6, max = 20))]
    pub customer_phone: String,
    #[validate(length(min = 1, max = 64))]
    pub voucher_code: Option<String>,
}

/// Deposit or membership payment request
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct TopUpRequest {
    #[validate(range(min = 1000, max = 100000000))]
    pub amount: i64,
    #[validate(length(min = 1, max = 16))]
    pub payment_method: String,
}

#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct VoucherCheckRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    #[validate(length(min = 1, max = 64))]
    pub product_ref: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct VoucherPreview {
    pub product_ref: String,
    pub price: i64,
    #[serde(flatten)]
    pub redemption: Redemption,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub merchant_order_id: String,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub amount: i64,
    pub discount_amount: i64,
    pub payment_method: String,
    /// Absent for balance-funded purchases
    pub payment_target: Option<PaymentTarget>,
    pub status_code: String,
    pub status_message: String,
    pub provider_reference: Option<String>,
}

/// Voucher to redeem inside the checkout transaction
struct VoucherClaim<'a> {
    code: &'a str,
    category_id: uuid::Uuid,
}

/// Builds orders and hands them to the gateway, or settles them from the
/// caller's balance.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DbPool>,
    catalog: Arc<dyn CatalogLookup>,
    gateway: Arc<dyn PaymentGateway>,
    provider: Arc<dyn FulfillmentProvider>,
    notifications: NotificationDispatcher,
    orders: OrderService,
    vouchers: VoucherService,
    ledger: LedgerService,
    accounts: AccountService,
    locks: PurchaseLocks,
    timeout: Duration,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DbPool>,
        catalog: Arc<dyn CatalogLookup>,
        gateway: Arc<dyn PaymentGateway>,
        provider: Arc<dyn FulfillmentProvider>,
        notifications: NotificationDispatcher,
        orders: OrderService,
        locks: PurchaseLocks,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            catalog,
            gateway,
            provider,
            notifications,
            orders,
            vouchers: VoucherService::new(),
            ledger: LedgerService::new(),
            accounts: AccountService::new(),
            locks,
            timeout,
        }
    }

    pub fn locks(&self) -> &PurchaseLocks {
        &self.locks
    }

    /// Product checkout. Gateway methods return a payment target and leave the
    /// order PENDING; `SALDO` debits the balance and submits to the provider
    /// straight away.
    #[instrument(skip(self, request), fields(product = %request.product_ref, method = %request.payment_method, caller = ?caller.username()))]
    pub async fn purchase(
        &self,
        caller: &Caller,
        request: PurchaseRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;
        let balance_funded = request.payment_method.eq_ignore_ascii_case(SALDO);
        if balance_funded && caller.username().is_none() {
            return Err(ServiceError::ValidationError(
                "balance payment requires a signed-in account".to_string(),
            ));
        }

        let _guard = self
            .locks
            .acquire(PurchaseKey::new(
                &request.buyer_reference,
                &request.product_ref,
                request.server_id.as_deref(),
            ))
            .await?;

        let tier = self.accounts.tier_of(&*self.db, caller.username()).await?;
        let quote = self.catalog.resolve_price(&request.product_ref, tier).await?;

        let now = Utc::now();
        let destination = match request.server_id.as_deref().map(str::trim) {
            Some(server) if !server.is_empty() => {
                format!("{}{}", request.buyer_reference.trim(), server)
            }
            _ => request.buyer_reference.trim().to_string(),
        };
        let method = if balance_funded {
            SALDO.to_string()
        } else {
            request.payment_method.trim().to_ascii_uppercase()
        };

        let draft = NewOrder {
            order_id: mint_order_id(OrderType::Purchase, now),
            order_type: OrderType::Purchase,
            product_ref: Some(quote.product_code.clone()),
            product_name: Some(quote.product_name.clone()),
            provider_sku: Some(quote.provider_sku.clone()),
            buyer_reference: destination,
            customer_phone: Some(request.customer_phone.clone()),
            username: caller.username().map(str::to_string),
            voucher_id: None,
            charge_amount: quote.amount,
            discount_amount: 0,
            final_amount: quote.amount,
            expected_profit: quote.profit_margin,
            payment_method: method,
            fee: 0,
        };
        let claim = request.voucher_code.as_deref().map(|code| VoucherClaim {
            code,
            category_id: quote.category_id,
        });

        if balance_funded {
            self.balance_checkout(draft, claim).await
        } else {
            self.gateway_checkout(draft, claim, caller).await
        }
    }

    /// Balance top-up paid through the gateway.
    pub async fn deposit(
        &self,
        caller: &Caller,
        request: TopUpRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        self.account_payment(caller, request, OrderType::Deposit, "Deposit saldo")
            .await
    }

    /// Membership payment. The tier change happens when the gateway confirms.
    pub async fn membership(
        &self,
        caller: &Caller,
        request: TopUpRequest,
    ) -> Result<CheckoutResponse, ServiceError> {
        self.account_payment(caller, request, OrderType::Membership, "Upgrade membership")
            .await
    }

    /// Discount the caller would get, without consuming the voucher.
    pub async fn preview_voucher(
        &self,
        caller: &Caller,
        request: VoucherCheckRequest,
    ) -> Result<VoucherPreview, ServiceError> {
        request.validate()?;
        let tier = self.accounts.tier_of(&*self.db, caller.username()).await?;
        let quote = self.catalog.resolve_price(&request.product_ref, tier).await?;
        let redemption = self
            .vouchers
            .quote(
                &*self.db,
                request.code.trim(),
                quote.amount,
                Some(quote.category_id),
                Utc::now(),
            )
            .await?;
        Ok(VoucherPreview {
            product_ref: quote.product_code,
            price: quote.amount,
            redemption,
        })
    }

    async fn account_payment(
        &self,
        caller: &Caller,
        request: TopUpRequest,
        order_type: OrderType,
        label: &str,
    ) -> Result<CheckoutResponse, ServiceError> {
        request.validate()?;
        let Some(username) = caller.username() else {
            return Err(ServiceError::ValidationError(format!(
                "{} requires a signed-in account",
                label
            )));
        };
        if request.payment_method.eq_ignore_ascii_case(SALDO) {
            return Err(ServiceError::ValidationError(format!(
                "{} cannot be paid from the balance",
                label
            )));
        }
        let user = self.accounts.require(&*self.db, username).await?;

        let draft = NewOrder {
            order_id: mint_order_id(order_type, Utc::now()),
            order_type,
            product_ref: None,
            product_name: Some(label.to_string()),
            provider_sku: None,
            buyer_reference: user.username.clone(),
            customer_phone: user.whatsapp.clone(),
            username: Some(user.username),
            voucher_id: None,
            charge_amount: request.amount,
            discount_amount: 0,
            final_amount: request.amount,
            expected_profit: 0,
            payment_method: request.payment_method.trim().to_ascii_uppercase(),
            fee: 0,
        };
        self.gateway_checkout(draft, None, caller).await
    }

    /// Redeem, record and charge in one transaction. A gateway failure rolls
    /// everything back and the attempt is then recorded as FAILED on its own.
    async fn gateway_checkout(
        &self,
        draft: NewOrder,
        claim: Option<VoucherClaim<'_>>,
        caller: &Caller,
    ) -> Result<CheckoutResponse, ServiceError> {
        let db = &*self.db;
        let failed_draft = draft.clone();

        let work = async {
            let txn = begin_serializable(db).await?;
            let new = self.apply_voucher(&txn, draft, claim).await?;
            if new.final_amount <= 0 {
                return Err(ServiceError::ValidationError(
                    "amount after discount must be positive for gateway payments".to_string(),
                ));
            }
            let new = NewOrder {
                fee: self.orders.fees().fee_for(&new.payment_method, new.final_amount),
                ..new
            };

            let charge_request = ChargeRequest {
                order_id: new.order_id.clone(),
                amount: new.final_amount,
                method: new.payment_method.clone(),
                product_details: new
                    .product_name
                    .clone()
                    .unwrap_or_else(|| new.order_type.to_string()),
                customer_name: caller.username().unwrap_or("Guest").to_string(),
                phone_number: new.customer_phone.clone().unwrap_or_default(),
            };

            let order = self.orders.create_pending(&txn, new).await?;
            let charge = self.gateway.create_charge(charge_request).await?;
            self.orders
                .attach_charge(
                    &txn,
                    &order.order_id,
                    charge.payment_target.as_str(),
                    charge.gateway_reference.clone(),
                    &charge.status_message,
                )
                .await?;
            txn.commit().await?;
            Ok::<_, ServiceError>((order, charge))
        };

        match with_deadline(self.timeout, "checkout", work).await {
            Ok((order, charge)) => {
                counter!("topup_checkout.created", 1, "order_type" => order.order_type.to_string());
                info!(order_id = %order.order_id, amount = order.final_amount, "checkout created");
                self.notifications.dispatch(notification_for(&order, None));
                Ok(CheckoutResponse {
                    merchant_order_id: order.order_id,
                    order_type: order.order_type,
                    status: order.status,
                    amount: order.final_amount,
                    discount_amount: order.discount_amount,
                    payment_method: order.payment_method,
                    payment_target: Some(charge.payment_target),
                    status_code: charge.status_code,
                    status_message: charge.status_message,
                    provider_reference: None,
                })
            }
            Err(err @ (ServiceError::GatewayError(_) | ServiceError::Timeout(_))) => {
                self.record_failure(failed_draft, &err).await;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Debit, mark paid and commit; then call the provider and apply its
    /// answer in a second transaction. No transaction stays open across the
    /// provider call.
    async fn balance_checkout(
        &self,
        draft: NewOrder,
        claim: Option<VoucherClaim<'_>>,
    ) -> Result<CheckoutResponse, ServiceError> {
        let db = &*self.db;

        let settle = async {
            let txn = begin_serializable(db).await?;
            let new = self.apply_voucher(&txn, draft, claim).await?;
            let username = new.username.clone().ok_or_else(|| {
                ServiceError::ValidationError("balance payment requires an account".to_string())
            })?;
            let order = self.orders.create_pending(&txn, new).await?;
            if order.final_amount > 0 {
                self.ledger
                    .apply_delta(
                        &txn,
                        BalanceChange {
                            username: &username,
                            delta: -order.final_amount,
                            change_type: LedgerChangeType::Usage,
                            description: format!(
                                "Purchase {} {}",
                                order.order_id,
                                order.product_name.as_deref().unwrap_or_default()
                            ),
                            order_ref: Some(&order.order_id),
                        },
                    )
                    .await?;
            }
            let paid = self
                .orders
                .mark_paid(&txn, &order, None, "Paid from balance")
                .await?
                .into_order();
            txn.commit().await?;
            Ok::<_, ServiceError>(paid)
        };
        let paid = with_deadline(self.timeout, "balance checkout", settle).await?;

        let request = FulfillmentRequest {
            provider_sku: paid.provider_sku.clone().unwrap_or_default(),
            destination: paid.buyer_reference.clone(),
            reference: paid.order_id.clone(),
        };
        let order = match self.provider.submit_fulfillment(request).await {
            Ok(result) => {
                let apply = async {
                    let txn = begin_serializable(db).await?;
                    let current = self.orders.lock_by_order_id(&txn, &paid.order_id).await?;
                    let transition = self
                        .orders
                        .mark_fulfillment_result(&txn, &current, &result)
                        .await?;
                    txn.commit().await?;
                    Ok::<_, ServiceError>(transition.into_order())
                };
                with_deadline(self.timeout, "balance checkout fulfillment", apply).await?
            }
            Err(e) => {
                // Paid and debited; the provider callback settles it later.
                warn!(order_id = %paid.order_id, error = %e, "provider submission failed");
                let note = format!("Provider submission failed: {}", e);
                if let Err(log_err) = self.orders.append_note(db, &paid.order_id, &note).await {
                    error!(error = %log_err, "could not record provider failure");
                }
                paid
            }
        };

        counter!("topup_checkout.balance", 1, "status" => order.status.to_string());
        self.notifications
            .dispatch(notification_for(&order, order.provider_reference.clone()));
        let message = status_message(&order);
        Ok(CheckoutResponse {
            merchant_order_id: order.order_id,
            order_type: order.order_type,
            status: order.status,
            amount: order.final_amount,
            discount_amount: order.discount_amount,
            payment_method: order.payment_method,
            payment_target: None,
            status_code: if order.status == OrderStatus::Failed {
                "02".to_string()
            } else {
                "00".to_string()
            },
            status_message: message.to_string(),
            provider_reference: order.provider_reference,
        })
    }

    async fn apply_voucher<C: ConnectionTrait>(
        &self,
        txn: &C,
        draft: NewOrder,
        claim: Option<VoucherClaim<'_>>,
    ) -> Result<NewOrder, ServiceError> {
        let Some(claim) = claim else {
            return Ok(draft);
        };
        let redemption = self
            .vouchers
            .redeem(
                txn,
                claim.code.trim(),
                draft.charge_amount,
                Some(claim.category_id),
                Utc::now(),
            )
            .await?;
        Ok(NewOrder {
            voucher_id: Some(redemption.voucher_id),
            discount_amount: redemption.discount_amount,
            final_amount: redemption.final_amount,
            ..draft
        })
    }

    async fn record_failure(&self, draft: NewOrder, err: &ServiceError) {
        let order_id = draft.order_id.clone();
        let reason = format!("Checkout failed: {}", err);
        let work = async {
            let txn = begin_serializable(&*self.db).await?;
            self.orders
                .record_failed_checkout(&txn, draft, &reason)
                .await?;
            txn.commit().await?;
            Ok::<_, ServiceError>(())
        };
        if let Err(e) = work.await {
            error!(%order_id, error = %e, "could not record failed checkout");
        }
    }
}

/// Receipt text for a balance checkout. A failed order only mentions the
/// refund when balance was actually debited for it.
fn status_message(order: &order::Model) -> &'static str {
    match order.status {
        OrderStatus::Pending => "Menunggu pembayaran",
        OrderStatus::Paid => "Pembayaran diterima, pesanan menunggu diproses",
        OrderStatus::Process => "Pesanan sedang diproses",
        OrderStatus::Success => "Pesanan berhasil",
        OrderStatus::Failed if order.username.is_some() && order.final_amount > 0 => {
            "Pesanan gagal, saldo dikembalikan"
        }
        OrderStatus::Failed => "Pesanan gagal",
    }
}

pub(crate) fn notification_for(order: &order::Model, detail: Option<String>) -> OrderNotification {
    OrderNotification {
        order_id: order.order_id.clone(),
        status: order.status,
        destination: order.customer_phone.clone().unwrap_or_default(),
        amount: order.final_amount,
        product_name: order.product_name.clone(),
        detail: detail.map(|sn| format!("SN: {}", sn)),
    }
}
