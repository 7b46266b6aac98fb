use axum::{extract::State, http::StatusCode, response::Json};
use serde::Serialize;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

use crate::{db, errors::ServiceError, ApiResponse, AppState};

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Call once on startup
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub uptime_secs: u64,
    pub database: ComponentHealth,
    pub provider: ComponentHealth,
    /// Remaining deposit with the goods provider, when reachable
    pub provider_balance: Option<i64>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub environment: String,
    pub timestamp: String,
}

const PROVIDER_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Liveness and dependency health
#[utoipa::path(
    get,
    path = "/health",
    summary = "Health check",
    description = "Database connectivity plus a provider balance inquiry. The provider being unreachable degrades but does not fail the check",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse),
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = match db::check_connection(&state.db).await {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Up,
            message: "connected".to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        },
        Err(e) => ComponentHealth {
            status: ComponentStatus::Down,
            message: e.to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
        },
    };

    let started = Instant::now();
    let (provider, provider_balance) =
        match tokio::time::timeout(PROVIDER_CHECK_TIMEOUT, state.services.provider.check_balance())
            .await
        {
            Ok(Ok(balance)) => (
                ComponentHealth {
                    status: ComponentStatus::Up,
                    message: "reachable".to_string(),
                    latency_ms: started.elapsed().as_millis() as u64,
                },
                Some(balance),
            ),
            Ok(Err(e)) => (
                ComponentHealth {
                    status: ComponentStatus::Degraded,
                    message: e.response_message(),
                    latency_ms: started.elapsed().as_millis() as u64,
                },
                None,
            ),
            Err(_) => (
                ComponentHealth {
                    status: ComponentStatus::Degraded,
                    message: "balance inquiry timed out".to_string(),
                    latency_ms: started.elapsed().as_millis() as u64,
                },
                None,
            ),
        };

    let status = match (database.status, provider.status) {
        (ComponentStatus::Down, _) => ComponentStatus::Down,
        (_, ComponentStatus::Up) => ComponentStatus::Up,
        _ => ComponentStatus::Degraded,
    };
    let code = if status == ComponentStatus::Down {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: uptime_secs(),
            database,
            provider,
            provider_balance,
        }),
    )
}

/// Service identity and version
#[utoipa::path(
    get,
    path = "/api/v1/status",
    summary = "API status",
    responses((status = 200, description = "Service status", body = ApiResponse<StatusResponse>)),
    tag = "Health"
)]
pub async fn api_status(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StatusResponse>>, ServiceError> {
    Ok(Json(ApiResponse::success(StatusResponse {
        status: "ok".to_string(),
        service: "topup-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: state.config.environment.clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })))
}
