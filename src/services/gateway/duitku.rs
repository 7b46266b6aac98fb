use super::{
    signature::{callback_signature, charge_signature, signatures_match},
    ChargeRequest, ChargeResponse, GatewayCallback, PaymentGateway, PaymentTarget,
};
use crate::{config::GatewayConfig, errors::ServiceError};
use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

const INQUIRY_PATH: &str = "/api/merchant/v2/inquiry";

/// Methods whose customer action is a redirect to a checkout page
const URL_METHODS: &[&str] = &["DA", "OV", "SP", "QR"];
/// Virtual account methods
const VA_METHODS: &[&str] = &["I1", "BR", "B1", "BT", "FT", "M2", "VA"];
/// QRIS methods that return a raw QR payload
const QR_METHODS: &[&str] = &["NQ", "QRIS"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InquiryRequest<'a> {
    merchant_code: &'a str,
    payment_amount: i64,
    merchant_order_id: &'a str,
    product_details: &'a str,
    payment_method: &'a str,
    customer_va_name: &'a str,
    phone_number: &'a str,
    return_url: &'a str,
    callback_url: &'a str,
    signature: String,
    expiry_period: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InquiryResponse {
    #[serde(default)]
    status_code: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    payment_url: Option<String>,
    #[serde(default)]
    va_number: Option<String>,
    #[serde(default)]
    qr_string: Option<String>,
    #[serde(default, rename = "Message")]
    error_message: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.trim().is_empty()).cloned()
}

/// Picks what the customer should see for `method`. Falls back through the
/// other fields when the expected one is missing.
fn payment_target_for(method: &str, response: &InquiryResponse) -> Option<PaymentTarget> {
    let url = non_empty(&response.payment_url).map(PaymentTarget::Url);
    let va = non_empty(&response.va_number).map(PaymentTarget::VaNumber);
    let qr = non_empty(&response.qr_string).map(PaymentTarget::QrString);

    let method = method.to_ascii_uppercase();
    let preferred = if URL_METHODS.contains(&method.as_str()) {
        url.clone()
    } else if VA_METHODS.contains(&method.as_str()) {
        va.clone()
    } else if QR_METHODS.contains(&method.as_str()) {
        qr.clone()
    } else {
        None
    };

    preferred.or(va).or(url).or(qr)
}

/// Duitku payment gateway client
#[derive(Debug, Clone)]
pub struct DuitkuGateway {
    client: Client,
    config: GatewayConfig,
}

impl DuitkuGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("gateway client: {}", e)))?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: GatewayConfig, client: Client) -> Self {
        Self { client, config }
    }

    fn inquiry_url(&self) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), INQUIRY_PATH)
    }
}

#[async_trait]
impl PaymentGateway for DuitkuGateway {
    #[instrument(skip(self, request), fields(order_id = %request.order_id, method = %request.method, amount = request.amount))]
    async fn create_charge(&self, request: ChargeRequest) -> Result<ChargeResponse, ServiceError> {
        let payload = InquiryRequest {
            merchant_code: &self.config.merchant_code,
            payment_amount: request.amount,
            merchant_order_id: &request.order_id,
            product_details: &request.product_details,
            payment_method: &request.method,
            customer_va_name: &request.customer_name,
            phone_number: &request.phone_number,
            return_url: &self.config.return_url,
            callback_url: &self.config.callback_url,
            signature: charge_signature(
                &self.config.merchant_code,
                &request.order_id,
                request.amount,
                &self.config.api_key,
            ),
            expiry_period: self.config.expiry_period,
        };

        let response = self.client.post(self.inquiry_url()).json(&payload).send().await?;
        let http_status = response.status();
        let body: InquiryResponse = response.json().await.unwrap_or_default();

        let status_code = body.status_code.clone().unwrap_or_default();
        if !http_status.is_success() || status_code != "00" {
            counter!("topup_gateway.charge_failed", 1);
            let message = body
                .status_message
                .clone()
                .or_else(|| body.error_message.clone())
                .unwrap_or_else(|| format!("HTTP {}", http_status.as_u16()));
            warn!(http_status = http_status.as_u16(), %status_code, %message, "charge rejected");
            return Err(ServiceError::GatewayError(message));
        }

        let payment_target = payment_target_for(&request.method, &body).ok_or_else(|| {
            ServiceError::GatewayError("gateway response has no payment target".to_string())
        })?;

        counter!("topup_gateway.charge_created", 1, "method" => request.method.clone());
        info!(reference = ?body.reference, "charge created");
        Ok(ChargeResponse {
            payment_target,
            gateway_reference: non_empty(&body.reference),
            status_code,
            status_message: body.status_message.unwrap_or_else(|| "SUCCESS".to_string()),
        })
    }

    fn verify_callback_signature(&self, callback: &GatewayCallback) -> Result<(), ServiceError> {
        if callback.merchant_code != self.config.merchant_code {
            return Err(ServiceError::Unauthorized("unknown merchant code".to_string()));
        }
        let expected = callback_signature(
            &self.config.merchant_code,
            &callback.order_id,
            &callback.amount,
            &callback.result_code,
            &self.config.api_key,
        );
        if !signatures_match(&expected, &callback.signature) {
            return Err(ServiceError::Unauthorized("bad signature".to_string()));
        }
        Ok(())
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

    fn config(base_url: String) -> GatewayConfig {
        GatewayConfig {
            merchant_code: "D0001".into(),
            api_key: "secret".into(),
            base_url,
            callback_url: "https://shop.test/api/v1/callbacks/duitku".into(),
            return_url: "https://shop.test/invoice".into(),
            expiry_period: 60,
            timeout_secs: 5,
        }
    }

    fn charge(method: &str) -> ChargeRequest {
        ChargeRequest {
            order_id: "VAZ-1-abcdef".into(),
            amount: 50_000,
            method: method.into(),
            product_details: "Diamond 86".into(),
            customer_name: "budi".into(),
            phone_number: "08123".into(),
        }
    }

    #[test]
    fn method_families_pick_their_field() {
        let response = InquiryResponse {
            payment_url: Some("https://pay.test/x".into()),
            va_number: Some("8808123".into()),
            qr_string: Some("000201".into()),
            ..Default::default()
        };
        assert_eq!(
            payment_target_for("OV", &response),
            Some(PaymentTarget::Url("https://pay.test/x".into()))
        );
        assert_eq!(
            payment_target_for("BT", &response),
            Some(PaymentTarget::VaNumber("8808123".into()))
        );
        assert_eq!(
            payment_target_for("nq", &response),
            Some(PaymentTarget::QrString("000201".into()))
        );
        assert_eq!(
            payment_target_for("ZZ", &response),
            Some(PaymentTarget::VaNumber("8808123".into()))
        );
    }

    #[test]
    fn missing_field_falls_back() {
        let response = InquiryResponse {
            payment_url: Some("https://pay.test/x".into()),
            qr_string: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(
            payment_target_for("NQ", &response),
            Some(PaymentTarget::Url("https://pay.test/x".into()))
        );
        assert_eq!(payment_target_for("NQ", &InquiryResponse::default()), None);
    }

    #[tokio::test]
    async fn create_charge_posts_signed_inquiry() {
        let server = MockServer::start().await;
        let signature = charge_signature("D0001", "VAZ-1-abcdef", 50_000, "secret");
        Mock::given(method("POST"))
            .and(path(INQUIRY_PATH))
            .and(body_partial_json(json!({
                "merchantCode": "D0001",
                "paymentAmount": 50000,
                "merchantOrderId": "VAZ-1-abcdef",
                "paymentMethod": "NQ",
                "signature": signature,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "merchantCode": "D0001",
                "reference": "DS1234",
                "qrString": "00020101021226",
                "statusCode": "00",
                "statusMessage": "SUCCESS"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = DuitkuGateway::new(config(server.uri())).unwrap();
        let response = gateway.create_charge(charge("NQ")).await.unwrap();
        assert_eq!(
            response.payment_target,
            PaymentTarget::QrString("00020101021226".into())
        );
        assert_eq!(response.gateway_reference.as_deref(), Some("DS1234"));
        assert_eq!(response.status_code, "00");
    }

    #[tokio::test]
    async fn rejected_inquiry_is_a_gateway_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(INQUIRY_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "Message": "Minimum Payment 10000 IDR"
            })))
            .mount(&server)
            .await;

        let gateway = DuitkuGateway::new(config(server.uri())).unwrap();
        let err = gateway.create_charge(charge("BT")).await.unwrap_err();
        assert_matches!(err, ServiceError::GatewayError(msg) if msg.contains("Minimum Payment"));
    }

    #[test]
    fn callback_signature_is_checked() {
        let gateway = DuitkuGateway::with_client(config("http://unused".into()), Client::new());
        let mut callback = GatewayCallback {
            merchant_code: "D0001".into(),
            order_id: "VAZ-1-abcdef".into(),
            amount: "50000".into(),
            result_code: "00".into(),
            signature: callback_signature("D0001", "VAZ-1-abcdef", "50000", "00", "secret"),
            reference: None,
            payment_code: Some("NQ".into()),
        };
        assert!(gateway.verify_callback_signature(&callback).is_ok());

        callback.amount = "5000".into();
        assert_matches!(
            gateway.verify_callback_signature(&callback),
            Err(ServiceError::Unauthorized(_))
        );

        callback.amount = "50000".into();
        callback.merchant_code = "D9999".into();
        assert_matches!(
            gateway.verify_callback_signature(&callback),
            Err(ServiceError::Unauthorized(_))
        );
    }
}
