use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Topup API",
        version = "1.0.0",
        description = r#"
# Topup API

Checkout, payment reconciliation and fulfillment for a digital goods top-up store.

## Callers

Session handling happens upstream. Authenticated requests carry the username in the
`x-user` header; requests without it are guest checkouts at the regular price.

## Callbacks

The payment gateway and the goods provider report results to the callback endpoints.
Callbacks are idempotent: repeating one never credits, refunds or redeems twice.

## Error Handling

Errors use a single JSON shape:

```json
{
  "error": "Bad Request",
  "message": "Voucher exhausted: SAVE10",
  "details": "conflict",
  "request_id": "5f0c...",
  "timestamp": "2024-06-01T00:00:00Z"
}
```
        "#,
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Checkout", description = "Purchases, deposits, memberships and vouchers"),
        (name = "Callbacks", description = "Gateway and provider callbacks"),
        (name = "Orders", description = "Order status"),
        (name = "Balance", description = "Account balance and ledger"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::checkout::create_checkout,
        crate::handlers::checkout::create_deposit,
        crate::handlers::checkout::create_membership,
        crate::handlers::checkout::check_voucher,
        crate::handlers::callbacks::gateway_callback,
        crate::handlers::callbacks::provider_callback,
        crate::handlers::orders::get_order,
        crate::handlers::balance::get_balance,
        crate::handlers::balance::get_balance_history,
        crate::handlers::health::health_check,
        crate::handlers::health::api_status,
    ),
    components(
        schemas(
            crate::services::checkout::PurchaseRequest,
            crate::services::checkout::TopUpRequest,
            crate::services::checkout::VoucherCheckRequest,
            crate::services::checkout::VoucherPreview,
            crate::services::checkout::CheckoutResponse,
            crate::services::vouchers::Redemption,
            crate::services::gateway::PaymentTarget,
            crate::services::reconciler::GatewayCallbackPayload,
            crate::services::reconciler::CallbackAck,
            crate::services::reconciler::ProviderCallbackPayload,
            crate::services::reconciler::ProviderCallbackData,
            crate::services::reconciler::ProviderAck,
            crate::services::reconciler::ProviderAckData,
            crate::handlers::orders::OrderView,
            crate::handlers::orders::PaymentView,
            crate::handlers::balance::BalanceView,
            crate::handlers::health::HealthResponse,
            crate::handlers::health::ComponentHealth,
            crate::handlers::health::ComponentStatus,
            crate::handlers::health::StatusResponse,
            crate::entities::order::OrderType,
            crate::entities::order::OrderStatus,
            crate::entities::payment::PaymentStatus,
            crate::entities::user::MembershipTier,
            crate::entities::ledger_entry::Model,
            crate::entities::ledger_entry::LedgerChangeType,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}
