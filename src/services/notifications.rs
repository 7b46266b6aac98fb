//! Customer notifications on order status changes. Delivery is fire-and-forget:
//! a failed notification is logged and never affects the order.

use crate::{config::NotificationConfig, entities::order::OrderStatus, errors::ServiceError};
use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn, Instrument};

/// What the customer is told about an order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderNotification {
    pub order_id: String,
    pub status: OrderStatus,
    pub destination: String,
    pub amount: i64,
    pub product_name: Option<String>,
    pub detail: Option<String>,
}

impl OrderNotification {
    pub fn render(&self, invoice_base_url: &str) -> String {
        let headline = match self.status {
            OrderStatus::Pending => "Menunggu pembayaran",
            OrderStatus::Paid => "Pembayaran diterima",
            OrderStatus::Process => "Pesanan sedang diproses",
            OrderStatus::Success => "Pesanan berhasil",
            OrderStatus::Failed => "Pesanan gagal",
        };
        let mut text = format!(
            "{}\nOrder: {}\nProduk: {}\nTotal: Rp {}",
            headline,
            self.order_id,
            self.product_name.as_deref().unwrap_or("-"),
            self.amount
        );
        if let Some(detail) = &self.detail {
            text.push_str(&format!("\n{}", detail));
        }
        if !invoice_base_url.is_empty() {
            text.push_str(&format!(
                "\nInvoice: {}/{}",
                invoice_base_url.trim_end_matches('/'),
                self.order_id
            ));
        }
        text
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &OrderNotification) -> Result<(), ServiceError>;
}

/// Writes notifications to the log. Used when no messaging endpoint is set.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &OrderNotification) -> Result<(), ServiceError> {
        info!(
            order_id = %notification.order_id,
            status = %notification.status,
            destination = %notification.destination,
            "order notification"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WhatsAppMessage<'a> {
    target: &'a str,
    message: String,
}

/// WhatsApp gateway notifier
#[derive(Debug, Clone)]
pub struct WhatsAppNotifier {
    client: Client,
    url: String,
    token: String,
    invoice_base_url: String,
}

impl WhatsAppNotifier {
    pub fn new(
        url: String,
        token: String,
        invoice_base_url: String,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("notifier client: {}", e)))?;
        Ok(Self {
            client,
            url,
            token,
            invoice_base_url,
        })
    }
}

#[async_trait]
impl Notifier for WhatsAppNotifier {
    async fn notify(&self, notification: &OrderNotification) -> Result<(), ServiceError> {
        let body = WhatsAppMessage {
            target: &notification.destination,
            message: notification.render(&self.invoice_base_url),
        };
        self.client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, &self.token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        debug!(order_id = %notification.order_id, "whatsapp notification sent");
        Ok(())
    }
}

/// Picks the notifier for the configuration: WhatsApp when both the URL and
/// token are set, otherwise the log.
pub fn notifier_from_config(config: &NotificationConfig) -> Result<Arc<dyn Notifier>, ServiceError> {
    match (&config.whatsapp_url, &config.whatsapp_token) {
        (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
            Ok(Arc::new(WhatsAppNotifier::new(
                url.clone(),
                token.clone(),
                config.invoice_base_url.clone(),
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        _ => Ok(Arc::new(LogNotifier)),
    }
}

/// Sends notifications on a background task so callers never wait on them.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Schedules delivery. Notifications without a destination are dropped.
    pub fn dispatch(&self, notification: OrderNotification) {
        if notification.destination.trim().is_empty() {
            debug!(order_id = %notification.order_id, "no destination; notification skipped");
            return;
        }
        let notifier = Arc::clone(&self.notifier);
        let span = tracing::info_span!("notify", order_id = %notification.order_id);
        tokio::spawn(
            async move {
                match notifier.notify(&notification).await {
                    Ok(()) => {
                        counter!("topup_notifications.sent", 1);
                    }
                    Err(e) => {
                        counter!("topup_notifications.failed", 1);
                        warn!(error = %e, "notification delivery failed");
                    }
                }
            }
            .instrument(span),
        );
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}
