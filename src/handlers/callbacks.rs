use axum::{
    extract::{FromRequest, Request, State},
    http::header::CONTENT_TYPE,
    response::Json,
    Form,
};
use tracing::warn;

use crate::{
    errors::ServiceError,
    services::reconciler::{
        CallbackAck, GatewayCallbackPayload, ProviderAck, ProviderCallbackPayload,
    },
    AppState,
};

fn is_form(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false)
}

/// Payment gateway callback
#[utoipa::path(
    post,
    path = "/api/v1/callbacks/duitku",
    summary = "Gateway payment callback",
    description = "Accepts JSON or form-encoded bodies. Once the order is found the response is always 200; `success` reports whether processing went through",
    request_body(content = GatewayCallbackPayload, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Callback acknowledged", body = CallbackAck),
        (status = 400, description = "Malformed callback or bad signature", body = crate::errors::ErrorResponse),
        (status = 404, description = "Unknown order", body = crate::errors::ErrorResponse),
    ),
    tag = "Callbacks"
)]
pub async fn gateway_callback(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<CallbackAck>, ServiceError> {
    let payload = if is_form(&request) {
        Form::<GatewayCallbackPayload>::from_request(request, &state)
            .await
            .map(|Form(p)| p)
            .map_err(|e| ServiceError::MalformedCallback(e.body_text()))?
    } else {
        Json::<GatewayCallbackPayload>::from_request(request, &state)
            .await
            .map(|Json(p)| p)
            .map_err(|e| ServiceError::MalformedCallback(e.body_text()))?
    };

    let ack = state
        .services
        .reconciler
        .handle_gateway_callback(payload)
        .await?;
    Ok(Json(ack))
}

/// Goods provider callback
#[utoipa::path(
    post,
    path = "/api/v1/callbacks/digiflazz",
    summary = "Provider delivery callback",
    description = "Always answers 200 in the provider's envelope: rc 00 processed, 07 missing parameters, 99 processing error",
    request_body = ProviderCallbackPayload,
    responses(
        (status = 200, description = "Callback acknowledged", body = ProviderAck),
    ),
    tag = "Callbacks"
)]
pub async fn provider_callback(State(state): State<AppState>, request: Request) -> Json<ProviderAck> {
    let payload = match Json::<ProviderCallbackPayload>::from_request(request, &state).await {
        Ok(Json(payload)) => payload,
        Err(e) => {
            warn!(error = %e.body_text(), "unreadable provider callback");
            return Json(ProviderAck::missing_parameters());
        }
    };
    Json(
        state
            .services
            .reconciler
            .handle_provider_callback(payload)
            .await,
    )
}
