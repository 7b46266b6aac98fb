//! Integration tests for product, deposit and membership checkout.

mod common;

use axum::http::{Method, StatusCode};
use chrono::{Duration, Utc};
use common::{purchase_body, response_json, TestApp};
use rstest::rstest;
use sea_orm::Set;
use serde_json::json;
use topup_api::{
    entities::{
        ledger_entry::LedgerChangeType,
        order::{OrderStatus, OrderType},
        payment::PaymentStatus,
        user::MembershipTier,
        voucher::{self, DiscountType},
    },
    services::ledger::verify_chain,
};

#[tokio::test]
async fn guest_gateway_purchase_returns_payment_target() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("ML-86", 50_000, 45_000).await;

    let response = app
        .checkout(purchase_body("ML-86", "NQ", "12345678"), None)
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = response_json(response).await;
    let data = &body["data"];
    let order_id = data["merchant_order_id"].as_str().unwrap();
    assert!(order_id.starts_with("VAZ-"));
    assert_eq!(data["status"], "PENDING");
    assert_eq!(data["amount"], 50_000);
    assert_eq!(data["payment_target"]["kind"], "qr_string");

    let order = app.order(order_id).await;
    assert_eq!(order.order_type, OrderType::Purchase);
    assert_eq!(order.provider_sku.as_deref(), Some("ml-86"));
    assert_eq!(order.username, None);

    let payment = app.payment(order_id).await;
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount_due, 50_000);
    assert_eq!(payment.fee, 350);
    assert_eq!(payment.external_reference.as_deref(), Some("DK-REF-1"));
}

#[tokio::test]
async fn server_id_is_appended_to_destination() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("ML-86", 20_000, 18_000).await;

    let mut body = purchase_body("ML-86", "BC", "12345678");
    body["server_id"] = json!("2001");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let data = response_json(response).await["data"].clone();
    assert_eq!(data["payment_target"]["kind"], "va_number");
    let order = app.order(data["merchant_order_id"].as_str().unwrap()).await;
    assert_eq!(order.buyer_reference, "123456782001");
}

#[tokio::test]
async fn platinum_member_pays_platinum_price() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_user("sari", MembershipTier::Platinum, 0).await;
    app.seed_product("FF-100", 50_000, 45_000).await;

    let response = app
        .checkout(purchase_body("FF-100", "NQ", "99887766"), Some("sari"))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let data = response_json(response).await["data"].clone();
    assert_eq!(data["amount"], 45_000);
}

#[tokio::test]
async fn percentage_voucher_is_capped_and_consumed() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("PLN-100", 100_000, 98_000).await;
    app.seed_voucher("SAVE10", DiscountType::Percentage, 10, Some(5_000), Some(10))
        .await;

    let mut body = purchase_body("PLN-100", "NQ", "5123456789");
    body["voucher_code"] = json!("SAVE10");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let data = response_json(response).await["data"].clone();
    assert_eq!(data["discount_amount"], 5_000);
    assert_eq!(data["amount"], 95_000);

    let order = app.order(data["merchant_order_id"].as_str().unwrap()).await;
    assert_eq!(order.charge_amount, 100_000);
    assert_eq!(order.final_amount, 95_000);
    assert!(order.voucher_id.is_some());
    assert_eq!(app.voucher("SAVE10").await.usage_count, 1);
}

#[tokio::test]
async fn voucher_preview_does_not_consume() {
    let app = TestApp::new().await;
    app.seed_product("PLN-100", 100_000, 98_000).await;
    app.seed_voucher("SAVE10", DiscountType::Percentage, 10, Some(5_000), Some(1))
        .await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/vouchers/check",
            Some(json!({ "code": "SAVE10", "product_ref": "PLN-100" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let data = response_json(response).await["data"].clone();
    assert_eq!(data["price"], 100_000);
    assert_eq!(data["discount_amount"], 5_000);
    assert_eq!(data["final_amount"], 95_000);
    assert_eq!(app.voucher("SAVE10").await.usage_count, 0);
}

#[tokio::test]
async fn exhausted_voucher_fails_preview() {
    let app = TestApp::new().await;
    app.seed_product("PLN-100", 100_000, 98_000).await;
    let voucher = app
        .seed_voucher("SAVE10", DiscountType::Percentage, 10, Some(5_000), Some(1))
        .await;
    app.edit_voucher(&voucher, |v| v.usage_count = Set(1)).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/vouchers/check",
            Some(json!({ "code": "SAVE10", "product_ref": "PLN-100" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Voucher exhausted"));
}

#[tokio::test]
async fn voucher_below_minimum_purchase_is_rejected() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("ML-86", 50_000, 45_000).await;
    let voucher = app
        .seed_voucher("BIGSPEND", DiscountType::Fixed, 5_000, None, None)
        .await;
    app.edit_voucher(&voucher, |v| v.min_purchase = Set(Some(75_000)))
        .await;

    let mut body = purchase_body("ML-86", "NQ", "12345678");
    body["voucher_code"] = json!("BIGSPEND");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Minimum purchase for this voucher is 75000"));

    assert!(app.orders().await.is_empty());
    assert_eq!(app.voucher("BIGSPEND").await.usage_count, 0);
}

fn expired(v: &mut voucher::ActiveModel) {
    v.expiry_date = Set(Utc::now() - Duration::hours(1));
}

fn not_started(v: &mut voucher::ActiveModel) {
    v.start_date = Set(Utc::now() + Duration::days(1));
}

fn inactive(v: &mut voucher::ActiveModel) {
    v.is_active = Set(false);
}

#[rstest]
#[case::expired(expired)]
#[case::not_started(not_started)]
#[case::inactive(inactive)]
#[tokio::test]
async fn voucher_outside_its_window_is_invalid(#[case] edit: fn(&mut voucher::ActiveModel)) {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("ML-86", 50_000, 45_000).await;
    let voucher = app
        .seed_voucher("WINDOW", DiscountType::Fixed, 5_000, None, None)
        .await;
    app.edit_voucher(&voucher, edit).await;

    let mut body = purchase_body("ML-86", "NQ", "12345678");
    body["voucher_code"] = json!("WINDOW");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Voucher invalid or expired"));

    assert!(app.orders().await.is_empty());
    assert_eq!(app.voucher("WINDOW").await.usage_count, 0);
}

#[tokio::test]
async fn voucher_for_other_category_is_rejected() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("PLN-100", 100_000, 98_000).await;
    let voucher = app
        .seed_voucher("GAMES5", DiscountType::Fixed, 5_000, None, None)
        .await;
    app.restrict_voucher(&voucher, uuid::Uuid::new_v4()).await;

    let mut body = purchase_body("PLN-100", "NQ", "5123456789");
    body["voucher_code"] = json!("GAMES5");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.orders().await.is_empty());
}

#[tokio::test]
async fn unknown_product_is_not_found() {
    let app = TestApp::new().await;
    let response = app
        .checkout(purchase_body("NOPE", "NQ", "12345678"), None)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_any_write() {
    let app = TestApp::new().await;
    app.seed_product("ML-86", 20_000, 18_000).await;

    let mut body = purchase_body("ML-86", "NQ", "12345678");
    body["customer_phone"] = json!("123");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.orders().await.is_empty());
}

#[tokio::test]
async fn gateway_rejection_records_failed_order_without_voucher() {
    let app = TestApp::new().await;
    app.gateway_rejects().await;
    app.seed_product("ML-86", 20_000, 18_000).await;
    app.seed_voucher("HEMAT", DiscountType::Fixed, 2_000, None, Some(5))
        .await;

    let mut body = purchase_body("ML-86", "OV", "12345678");
    body["voucher_code"] = json!("HEMAT");
    let response = app.checkout(body, None).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let orders = app.orders().await;
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Failed);
    assert_eq!(orders[0].voucher_id, None);
    assert!(orders[0]
        .log
        .as_deref()
        .unwrap_or_default()
        .contains("Payment channel not available"));
    assert_eq!(app.payment(&orders[0].order_id).await.status, PaymentStatus::Failed);
    assert_eq!(app.voucher("HEMAT").await.usage_count, 0);
}

#[tokio::test]
async fn balance_purchase_delivers_immediately() {
    let app = TestApp::new().await;
    app.seed_user("budi", MembershipTier::Regular, 100_000).await;
    app.seed_product("ML-86", 50_000, 45_000).await;
    app.provider_answers("Sukses", "SN-0001", 48_500, Some(1)).await;

    let response = app
        .checkout(purchase_body("ML-86", "SALDO", "12345678"), Some("budi"))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let data = response_json(response).await["data"].clone();
    assert_eq!(data["status"], "SUCCESS");
    assert_eq!(data["provider_reference"], "SN-0001");
    assert!(data["payment_target"].is_null());

    let order = app.order(data["merchant_order_id"].as_str().unwrap()).await;
    assert_eq!(order.purchase_price, Some(48_500));
    assert_eq!(order.profit_amount, Some(1_500));
    assert_eq!(app.user("budi").await.balance, 50_000);

    let ledger = app.ledger("budi").await;
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].change_type, LedgerChangeType::Usage);
    assert_eq!(ledger[0].amount_delta, -50_000);
    assert_eq!(verify_chain(100_000, &ledger), Ok(50_000));
}

#[tokio::test]
async fn balance_purchase_failed_by_provider_is_refunded_in_full() {
    let app = TestApp::new().await;
    app.seed_user("budi", MembershipTier::Regular, 100_000).await;
    app.seed_product("ML-86", 50_000, 45_000).await;
    app.provider_answers("Gagal", "", 0, Some(1)).await;

    let response = app
        .checkout(purchase_body("ML-86", "SALDO", "12345678"), Some("budi"))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let data = response_json(response).await["data"].clone();
    assert_eq!(data["status"], "FAILED");
    assert_eq!(data["status_code"], "02");
    assert_eq!(data["status_message"], "Pesanan gagal, saldo dikembalikan");

    assert_eq!(app.user("budi").await.balance, 100_000);
    let ledger = app.ledger("budi").await;
    let kinds: Vec<_> = ledger.iter().map(|e| e.change_type).collect();
    assert_eq!(kinds, vec![LedgerChangeType::Usage, LedgerChangeType::Refund]);
    assert_eq!(verify_chain(100_000, &ledger), Ok(100_000));
}

#[tokio::test]
async fn free_balance_purchase_failure_does_not_promise_refund() {
    let app = TestApp::new().await;
    app.seed_user("budi", MembershipTier::Regular, 10_000).await;
    app.seed_product("ML-86", 50_000, 45_000).await;
    app.seed_voucher("GRATIS", DiscountType::Fixed, 50_000, None, None)
        .await;
    app.provider_answers("Gagal", "", 0, Some(1)).await;

    let mut body = purchase_body("ML-86", "SALDO", "12345678");
    body["voucher_code"] = json!("GRATIS");
    let response = app.checkout(body, Some("budi")).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let data = response_json(response).await["data"].clone();
    assert_eq!(data["status"], "FAILED");
    assert_eq!(data["amount"], 0);
    assert_eq!(data["status_message"], "Pesanan gagal");

    assert_eq!(app.user("budi").await.balance, 10_000);
    assert!(app.ledger("budi").await.is_empty());
    assert_eq!(app.voucher("GRATIS").await.usage_count, 0);
}

#[tokio::test]
async fn balance_purchase_with_insufficient_funds_changes_nothing() {
    let app = TestApp::new().await;
    app.seed_user("budi", MembershipTier::Regular, 10_000).await;
    app.seed_product("ML-86", 50_000, 45_000).await;

    let response = app
        .checkout(purchase_body("ML-86", "SALDO", "12345678"), Some("budi"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Insufficient balance"));

    assert_eq!(app.user("budi").await.balance, 10_000);
    assert!(app.ledger("budi").await.is_empty());
    assert!(app.orders().await.is_empty());
}

#[tokio::test]
async fn balance_purchase_requires_account() {
    let app = TestApp::new().await;
    app.seed_product("ML-86", 50_000, 45_000).await;

    let response = app
        .checkout(purchase_body("ML-86", "SALDO", "12345678"), None)
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn provider_outage_leaves_balance_order_paid() {
    let app = TestApp::new().await;
    app.seed_user("budi", MembershipTier::Regular, 100_000).await;
    app.seed_product("ML-86", 50_000, 45_000).await;
    app.provider_unreachable().await;

    let response = app
        .checkout(purchase_body("ML-86", "SALDO", "12345678"), Some("budi"))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let data = response_json(response).await["data"].clone();
    assert_eq!(data["status"], "PAID");

    let order = app.order(data["merchant_order_id"].as_str().unwrap()).await;
    assert!(order
        .log
        .as_deref()
        .unwrap_or_default()
        .contains("Provider submission failed"));
    assert_eq!(app.user("budi").await.balance, 50_000);
}

#[tokio::test]
async fn deposit_requires_signed_in_user() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/deposits",
            Some(json!({ "amount": 50_000, "payment_method": "NQ" })),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deposit_and_membership_create_typed_orders() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_user("budi", MembershipTier::Regular, 0).await;

    let response = app
        .request(
            Method::POST,
            "/api/v1/deposits",
            Some(json!({ "amount": 50_000, "payment_method": "NQ" })),
            Some("budi"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let deposit_id = response_json(response).await["data"]["merchant_order_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(deposit_id.starts_with("DEP-"));
    assert_eq!(app.order(&deposit_id).await.order_type, OrderType::Deposit);

    let response = app
        .request(
            Method::POST,
            "/api/v1/memberships",
            Some(json!({ "amount": 100_000, "payment_method": "BC" })),
            Some("budi"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let membership_id = response_json(response).await["data"]["merchant_order_id"]
        .as_str()
        .unwrap()
        .to_string();
    assert!(membership_id.starts_with("MEM-"));

    let response = app
        .request(
            Method::POST,
            "/api/v1/deposits",
            Some(json!({ "amount": 50_000, "payment_method": "SALDO" })),
            Some("budi"),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn order_status_is_readable() {
    let app = TestApp::new().await;
    app.gateway_accepts().await;
    app.seed_product("ML-86", 20_000, 18_000).await;

    let response = app
        .checkout(purchase_body("ML-86", "DA", "12345678"), None)
        .await;
    let order_id = response_json(response).await["data"]["merchant_order_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .request(Method::GET, &format!("/api/v1/orders/{}", order_id), None, None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let data = response_json(response).await["data"].clone();
    assert_eq!(data["status"], "PENDING");
    assert_eq!(data["payment"]["payment_target"], "https://pay.example/DK-REF-1");

    let response = app
        .request(Method::GET, "/api/v1/orders/VAZ-0-missing", None, None)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
