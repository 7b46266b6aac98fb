use super::{
    signature::{provider_balance_signature, provider_signature},
    FulfillmentProvider, FulfillmentRequest, FulfillmentResult, ProviderStatus,
};
use crate::{config::ProviderConfig, errors::ServiceError};
use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Serialize)]
struct TransactionRequest<'a> {
    username: &'a str,
    buyer_sku_code: &'a str,
    customer_no: &'a str,
    ref_id: &'a str,
    sign: String,
}

#[derive(Debug, Serialize)]
struct BalanceRequest<'a> {
    cmd: &'static str,
    username: &'a str,
    sign: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sn: Option<String>,
    #[serde(default)]
    price: Option<i64>,
    #[serde(default)]
    rc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceData {
    deposit: i64,
}

/// Digiflazz prepaid goods provider
#[derive(Debug, Clone)]
pub struct DigiflazzProvider {
    client: Client,
    config: ProviderConfig,
}

impl DigiflazzProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("provider client: {}", e)))?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: ProviderConfig, client: Client) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl FulfillmentProvider for DigiflazzProvider {
    #[instrument(skip(self, request), fields(reference = %request.reference, sku = %request.provider_sku))]
    async fn submit_fulfillment(
        &self,
        request: FulfillmentRequest,
    ) -> Result<FulfillmentResult, ServiceError> {
        let payload = TransactionRequest {
            username: &self.config.username,
            buyer_sku_code: &request.provider_sku,
            customer_no: &request.destination,
            ref_id: &request.reference,
            sign: provider_signature(
                &self.config.username,
                &self.config.api_key,
                &request.reference,
            ),
        };

        let response = self
            .client
            .post(self.url("transaction"))
            .json(&payload)
            .send()
            .await?;
        let http_status = response.status();
        let envelope: Envelope<TransactionData> = response.json().await.map_err(|e| {
            ServiceError::GatewayError(format!(
                "unreadable provider response (HTTP {}): {}",
                http_status.as_u16(),
                e
            ))
        })?;
        let data = envelope.data;

        let status = ProviderStatus::parse(data.status.as_deref().unwrap_or_default());
        counter!("topup_provider.transactions", 1, "status" => status.to_string());
        if status == ProviderStatus::Failed {
            warn!(rc = ?data.rc, message = ?data.message, "provider rejected transaction");
        } else {
            info!(%status, rc = ?data.rc, "provider accepted transaction");
        }

        Ok(FulfillmentResult {
            status,
            sn: data.sn.filter(|sn| !sn.is_empty()),
            price: data.price,
            message: data.message,
        })
    }

    async fn check_balance(&self) -> Result<i64, ServiceError> {
        let payload = BalanceRequest {
            cmd: "deposit",
            username: &self.config.username,
            sign: provider_balance_signature(&self.config.username, &self.config.api_key),
        };
        let response = self
            .client
            .post(self.url("cek-saldo"))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        let envelope: Envelope<BalanceData> = response.json().await?;
        Ok(envelope.data.deposit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::{
        matchers::{body_partial_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn provider(base_url: String) -> DigiflazzProvider {
        DigiflazzProvider::new(ProviderConfig {
            username: "shop".into(),
            api_key: "dev-key".into(),
            base_url,
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn request() -> FulfillmentRequest {
        FulfillmentRequest {
            provider_sku: "ML86".into(),
            destination: "12345678(1234)".into(),
            reference: "VAZ-1-abcdef".into(),
        }
    }

    #[tokio::test]
    async fn transaction_is_signed_with_ref_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction"))
            .and(body_partial_json(json!({
                "username": "shop",
                "buyer_sku_code": "ML86",
                "ref_id": "VAZ-1-abcdef",
                "sign": provider_signature("shop", "dev-key", "VAZ-1-abcdef"),
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "ref_id": "VAZ-1-abcdef",
                    "status": "Sukses",
                    "message": "Transaksi Sukses",
                    "sn": "SN-998877",
                    "price": 19000,
                    "rc": "00"
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let result = provider(server.uri())
            .submit_fulfillment(request())
            .await
            .unwrap();
        assert_eq!(result.status, ProviderStatus::Success);
        assert_eq!(result.sn.as_deref(), Some("SN-998877"));
        assert_eq!(result.price, Some(19_000));
    }

    #[tokio::test]
    async fn pending_and_failed_statuses_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "status": "Pending", "message": "Transaksi Pending", "sn": "" }
            })))
            .mount(&server)
            .await;

        let result = provider(server.uri())
            .submit_fulfillment(request())
            .await
            .unwrap();
        assert_eq!(result.status, ProviderStatus::Pending);
        assert_eq!(result.sn, None);
    }

    #[tokio::test]
    async fn unreadable_response_is_a_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/transaction"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = provider(server.uri())
            .submit_fulfillment(request())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::GatewayError(_));
    }

    #[tokio::test]
    async fn balance_inquiry_reads_deposit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cek-saldo"))
            .and(body_partial_json(json!({
                "cmd": "deposit",
                "username": "shop",
                "sign": provider_balance_signature("shop", "dev-key"),
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "data": { "deposit": 1250000 } })),
            )
            .mount(&server)
            .await;

        assert_eq!(provider(server.uri()).check_balance().await.unwrap(), 1_250_000);
    }
}
