// Pricing, vouchers and fees
pub mod fees;
pub mod pricing;
pub mod vouchers;

// Accounts and balance
pub mod accounts;
pub mod ledger;

// Orders and reconciliation
pub mod checkout;
pub mod orders;
pub mod purchase_lock;
pub mod reconciler;

// External integrations
pub mod gateway;
pub mod notifications;

use crate::{config::ReconciliationConfig, db::DbPool};
use std::sync::Arc;

use self::{
    accounts::AccountService,
    checkout::CheckoutService,
    fees::FeePolicy,
    gateway::{FulfillmentProvider, PaymentGateway},
    ledger::LedgerService,
    notifications::{NotificationDispatcher, Notifier},
    orders::OrderService,
    pricing::CatalogLookup,
    purchase_lock::PurchaseLocks,
    reconciler::CallbackReconciler,
};

/// External collaborators, swapped for fakes in tests
#[derive(Clone)]
pub struct Integrations {
    pub catalog: Arc<dyn CatalogLookup>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub provider: Arc<dyn FulfillmentProvider>,
    pub notifier: Arc<dyn Notifier>,
}

/// Services shared by the HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: CheckoutService,
    pub reconciler: CallbackReconciler,
    pub orders: OrderService,
    pub ledger: LedgerService,
    pub accounts: AccountService,
    pub provider: Arc<dyn FulfillmentProvider>,
}

impl AppServices {
    pub fn new(db: Arc<DbPool>, integrations: Integrations, config: &ReconciliationConfig) -> Self {
        let orders = OrderService::new(FeePolicy::from(config));
        let notifications = NotificationDispatcher::new(integrations.notifier);
        let locks = PurchaseLocks::new(config.max_concurrent_purchases, config.purchase_lock_wait());

        let checkout = CheckoutService::new(
            Arc::clone(&db),
            integrations.catalog,
            Arc::clone(&integrations.gateway),
            Arc::clone(&integrations.provider),
            notifications.clone(),
            orders.clone(),
            locks,
            config.checkout_timeout(),
        );
        let reconciler = CallbackReconciler::new(
            db,
            integrations.gateway,
            Arc::clone(&integrations.provider),
            notifications,
            orders.clone(),
            config.clone(),
        );

        Self {
            checkout,
            reconciler,
            orders,
            ledger: LedgerService::new(),
            accounts: AccountService::new(),
            provider: integrations.provider,
        }
    }
}
