#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request},
    response::Response,
    Router,
};
use chrono::{Duration, Utc};
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use topup_api::{
    config::{AppConfig, GatewayConfig, NotificationConfig, ProviderConfig, ReconciliationConfig},
    db,
    entities::{
        ledger_entry, order, payment, product,
        user::{self, MembershipTier},
        voucher::{self, DiscountType},
        voucher_category,
    },
    middleware_helpers::CALLER_HEADER,
    services::{
        gateway::{signature::callback_signature, DigiflazzProvider, DuitkuGateway},
        notifications::LogNotifier,
        pricing::DbCatalog,
        AppServices, Integrations,
    },
    AppState,
};

pub const MERCHANT_CODE: &str = "D0001";
pub const GATEWAY_KEY: &str = "gateway-test-key";

/// Application wired to a throwaway SQLite file and mocked gateway/provider.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    pub gateway: MockServer,
    pub provider: MockServer,
    _db_dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        let gateway = MockServer::start().await;
        let provider = MockServer::start().await;

        let db_dir = tempfile::tempdir().expect("temp dir for test database");
        let db_path = db_dir.path().join("topup_test.db");

        let mut cfg = AppConfig::new(
            format!("sqlite://{}?mode=rwc", db_path.display()),
            "127.0.0.1".to_string(),
            18_080,
            "test".to_string(),
            GatewayConfig {
                merchant_code: MERCHANT_CODE.to_string(),
                api_key: GATEWAY_KEY.to_string(),
                base_url: gateway.uri(),
                callback_url: "http://localhost/api/v1/callbacks/duitku".to_string(),
                return_url: "http://localhost/invoice".to_string(),
                expiry_period: 60,
                timeout_secs: 5,
            },
            ProviderConfig {
                username: "shop".to_string(),
                api_key: "provider-test-key".to_string(),
                base_url: provider.uri(),
                timeout_secs: 5,
            },
        );
        // One connection so concurrent requests queue on the pool the same
        // way they would on row locks.
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.db_acquire_timeout_secs = 30;
        cfg.notifications = NotificationConfig::default();
        cfg.reconciliation = ReconciliationConfig::default();

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db_arc = Arc::new(pool);

        let integrations = Integrations {
            catalog: Arc::new(DbCatalog::new(db_arc.clone())),
            gateway: Arc::new(DuitkuGateway::new(cfg.duitku.clone()).expect("gateway client")),
            provider: Arc::new(
                DigiflazzProvider::new(cfg.digiflazz.clone()).expect("provider client"),
            ),
            notifier: Arc::new(LogNotifier),
        };
        let services = AppServices::new(db_arc.clone(), integrations, &cfg.reconciliation);

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
        };
        let router = topup_api::app_router(state.clone());

        Self {
            router,
            state,
            gateway,
            provider,
            _db_dir: db_dir,
        }
    }

    /// Sends a request, optionally as a signed-in user.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        user: Option<&str>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(username) = user {
            builder = builder.header(CALLER_HEADER, username);
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn post_form(&self, uri: &str, fields: &[(&str, &str)]) -> Response {
        let encoded = fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(encoded))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    pub async fn checkout(&self, body: Value, user: Option<&str>) -> Response {
        self.request(Method::POST, "/api/v1/checkout", Some(body), user)
            .await
    }

    /// Sends a correctly signed gateway callback.
    pub async fn gateway_callback(&self, order_id: &str, amount: i64, result_code: &str) -> Response {
        let amount = amount.to_string();
        let signature =
            callback_signature(MERCHANT_CODE, order_id, &amount, result_code, GATEWAY_KEY);
        self.request(
            Method::POST,
            "/api/v1/callbacks/duitku",
            Some(json!({
                "merchantCode": MERCHANT_CODE,
                "amount": amount,
                "merchantOrderId": order_id,
                "resultCode": result_code,
                "reference": format!("DK-{}", order_id),
                "signature": signature,
            })),
            None,
        )
        .await
    }

    pub async fn provider_callback(&self, data: Value) -> Response {
        self.request(
            Method::POST,
            "/api/v1/callbacks/digiflazz",
            Some(json!({ "data": data })),
            None,
        )
        .await
    }

    // ---- mocked integrations ----

    /// Gateway accepts every charge and returns all three payment targets.
    pub async fn gateway_accepts(&self) {
        Mock::given(method("POST"))
            .and(path("/api/merchant/v2/inquiry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "merchantCode": MERCHANT_CODE,
                "reference": "DK-REF-1",
                "paymentUrl": "https://pay.example/DK-REF-1",
                "vaNumber": "8801234567",
                "qrString": "00020101021226670016COM.NOBUBANK",
                "statusCode": "00",
                "statusMessage": "SUCCESS"
            })))
            .mount(&self.gateway)
            .await;
    }

    pub async fn gateway_rejects(&self) {
        Mock::given(method("POST"))
            .and(path("/api/merchant/v2/inquiry"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "Message": "Payment channel not available"
            })))
            .mount(&self.gateway)
            .await;
    }

    /// Provider answers every transaction with `status`, expecting exactly
    /// `times` submissions when given.
    pub async fn provider_answers(&self, status: &str, sn: &str, price: i64, times: Option<u64>) {
        let mock = Mock::given(method("POST"))
            .and(path("/transaction"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "status": status,
                    "message": format!("Transaksi {}", status),
                    "sn": sn,
                    "price": price,
                    "rc": if status == "Gagal" { "02" } else { "00" }
                }
            })));
        let mock = match times {
            Some(n) => mock.expect(n),
            None => mock,
        };
        mock.mount(&self.provider).await;
    }

    pub async fn provider_unreachable(&self) {
        Mock::given(method("POST"))
            .and(path("/transaction"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&self.provider)
            .await;
    }

    // ---- seeding ----

    pub async fn seed_user(&self, username: &str, tier: MembershipTier, balance: i64) -> user::Model {
        let now = Utc::now();
        user::ActiveModel {
            id: Set(Uuid::new_v4()),
            username: Set(username.to_string()),
            tier: Set(tier),
            balance: Set(balance),
            whatsapp: Set(Some("081234567890".to_string())),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed user")
    }

    /// Product priced at `price` for every tier except platinum.
    pub async fn seed_product(&self, code: &str, price: i64, platinum_price: i64) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            name: Set(format!("Produk {}", code)),
            category_id: Set(Uuid::new_v4()),
            provider_sku: Set(code.to_lowercase()),
            price_regular: Set(price),
            price_gold: Set(price),
            price_platinum: Set(platinum_price),
            price_reseller: Set(price),
            profit_regular: Set(2_000),
            profit_gold: Set(1_500),
            profit_platinum: Set(1_000),
            profit_reseller: Set(500),
            is_flash_sale: Set(false),
            flash_sale_price: Set(None),
            flash_sale_expires_at: Set(None),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_voucher(
        &self,
        code: &str,
        discount_type: DiscountType,
        value: i64,
        max_discount: Option<i64>,
        usage_limit: Option<i32>,
    ) -> voucher::Model {
        let now = Utc::now();
        voucher::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            discount_type: Set(discount_type),
            discount_value: Set(value),
            max_discount: Set(max_discount),
            min_purchase: Set(None),
            usage_limit: Set(usage_limit),
            usage_count: Set(0),
            is_active: Set(true),
            is_for_all_categories: Set(true),
            start_date: Set(now - Duration::days(1)),
            expiry_date: Set(now + Duration::days(30)),
            description: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed voucher")
    }

    /// Restricts a voucher to one category.
    pub async fn restrict_voucher(&self, voucher: &voucher::Model, category_id: Uuid) {
        let mut active: voucher::ActiveModel = voucher.clone().into();
        active.is_for_all_categories = Set(false);
        active.update(&*self.state.db).await.expect("update voucher");

        voucher_category::ActiveModel {
            id: Set(Uuid::new_v4()),
            voucher_id: Set(voucher.id),
            category_id: Set(category_id),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed voucher category");
    }

    /// Applies `edit` to a seeded voucher and stores it.
    pub async fn edit_voucher(
        &self,
        voucher: &voucher::Model,
        edit: impl FnOnce(&mut voucher::ActiveModel),
    ) -> voucher::Model {
        let mut active: voucher::ActiveModel = voucher.clone().into();
        edit(&mut active);
        active.update(&*self.state.db).await.expect("update voucher")
    }

    // ---- reads ----

    pub async fn order(&self, order_id: &str) -> order::Model {
        order::Entity::find()
            .filter(order::Column::OrderId.eq(order_id))
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn orders(&self) -> Vec<order::Model> {
        order::Entity::find()
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.state.db)
            .await
            .expect("query orders")
    }

    pub async fn payment(&self, order_id: &str) -> payment::Model {
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(&*self.state.db)
            .await
            .expect("query payment")
            .expect("payment exists")
    }

    pub async fn user(&self, username: &str) -> user::Model {
        user::Entity::find()
            .filter(user::Column::Username.eq(username))
            .one(&*self.state.db)
            .await
            .expect("query user")
            .expect("user exists")
    }

    pub async fn voucher(&self, code: &str) -> voucher::Model {
        voucher::Entity::find()
            .filter(voucher::Column::Code.eq(code))
            .one(&*self.state.db)
            .await
            .expect("query voucher")
            .expect("voucher exists")
    }

    pub async fn ledger(&self, username: &str) -> Vec<ledger_entry::Model> {
        ledger_entry::Entity::find()
            .filter(ledger_entry::Column::Username.eq(username))
            .order_by_asc(ledger_entry::Column::Id)
            .all(&*self.state.db)
            .await
            .expect("query ledger")
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub fn purchase_body(product: &str, method: &str, buyer: &str) -> Value {
    json!({
        "product_ref": product,
        "payment_method": method,
        "buyer_reference": buyer,
        "customer_phone": "081234567890"
    })
}
