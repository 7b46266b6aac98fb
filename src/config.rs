use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_DUITKU_BASE_URL: &str = "https://sandbox.duitku.com/webapi";
const DEFAULT_DIGIFLAZZ_BASE_URL: &str = "https://api.digiflazz.com/v1";

/// Payment gateway (Duitku) credentials and endpoints
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[validate(length(min = 1))]
    pub merchant_code: String,

    #[validate(length(min = 1))]
    pub api_key: String,

    #[serde(default = "default_duitku_base_url")]
    pub base_url: String,

    /// Where the gateway posts payment results
    #[serde(default)]
    pub callback_url: String,

    /// Where the customer lands after paying
    #[serde(default)]
    pub return_url: String,

    /// Minutes before an unpaid charge expires
    #[serde(default = "default_expiry_period")]
    pub expiry_period: u32,

    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

/// Goods provider (Digiflazz) credentials
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[validate(length(min = 1))]
    pub username: String,

    #[validate(length(min = 1))]
    pub api_key: String,

    #[serde(default = "default_digiflazz_base_url")]
    pub base_url: String,

    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

/// Outbound customer notifications
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationConfig {
    /// WhatsApp relay endpoint; notifications are only logged when unset
    #[serde(default)]
    pub whatsapp_url: Option<String>,

    #[serde(default)]
    pub whatsapp_token: Option<String>,

    /// Base URL used to build invoice links, e.g. https://shop.example/invoice
    #[serde(default)]
    pub invoice_base_url: String,

    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

/// Knobs for checkout and callback processing
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ReconciliationConfig {
    /// Upper bound on a checkout transaction (gateway call included)
    #[serde(default = "default_checkout_tx_timeout_secs")]
    pub checkout_tx_timeout_secs: u64,

    /// Upper bound on a callback transaction (fulfillment call included)
    #[serde(default = "default_callback_tx_timeout_secs")]
    pub callback_tx_timeout_secs: u64,

    /// How long a checkout waits for the same purchase key to free up
    #[serde(default = "default_purchase_lock_wait_ms")]
    pub purchase_lock_wait_ms: u64,

    /// Concurrent checkouts allowed across all purchase keys
    #[serde(default = "default_max_concurrent_purchases")]
    #[validate(range(min = 1))]
    pub max_concurrent_purchases: usize,

    /// Payment methods that carry the QRIS processing fee
    #[serde(default = "default_fee_methods")]
    pub fee_methods: Vec<String>,

    /// Fee rate as a fraction, 0.007 = 0.7%
    #[serde(default = "default_fee_rate")]
    #[validate(custom = "validate_fee_rate")]
    pub fee_rate: Decimal,

    /// Membership payments at or above this amount upgrade a regular user to platinum
    #[serde(default = "default_platinum_threshold")]
    pub platinum_threshold: i64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            checkout_tx_timeout_secs: default_checkout_tx_timeout_secs(),
            callback_tx_timeout_secs: default_callback_tx_timeout_secs(),
            purchase_lock_wait_ms: default_purchase_lock_wait_ms(),
            max_concurrent_purchases: default_max_concurrent_purchases(),
            fee_methods: default_fee_methods(),
            fee_rate: default_fee_rate(),
            platinum_threshold: default_platinum_threshold(),
        }
    }
}

impl ReconciliationConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_secs(self.checkout_tx_timeout_secs)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_secs(self.callback_tx_timeout_secs)
    }

    pub fn purchase_lock_wait(&self) -> Duration {
        Duration::from_millis(self.purchase_lock_wait_ms)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// Comma separated list of allowed CORS origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Explicitly allow any origin outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// Per-request timeout applied at the HTTP layer
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Database pool tuning
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    pub duitku: GatewayConfig,

    pub digiflazz: ProviderConfig,

    #[serde(default)]
    pub notifications: NotificationConfig,

    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
}

impl AppConfig {
    pub fn new(
        database_url: String,
        host: String,
        port: u16,
        environment: String,
        duitku: GatewayConfig,
        digiflazz: ProviderConfig,
    ) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            request_timeout_secs: default_request_timeout_secs(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            duitku,
            digiflazz,
            notifications: NotificationConfig::default(),
            reconciliation: ReconciliationConfig::default(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_deref()
            .map(|v| v.split(',').any(|o| !o.trim().is_empty()))
            .unwrap_or(false)
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.is_production() && self.duitku.callback_url.trim().is_empty() {
            let mut err = ValidationError::new("duitku_callback_url_required");
            err.message = Some("Set APP__DUITKU__CALLBACK_URL so payments can be confirmed".into());
            errors.add("duitku", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validates the root and every nested section.
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        self.duitku.validate()?;
        self.digiflazz.validate()?;
        self.reconciliation.validate()?;
        self.validate_additional_constraints()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_request_timeout_secs() -> u64 {
    45
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_duitku_base_url() -> String {
    DEFAULT_DUITKU_BASE_URL.to_string()
}

fn default_digiflazz_base_url() -> String {
    DEFAULT_DIGIFLAZZ_BASE_URL.to_string()
}

fn default_expiry_period() -> u32 {
    60
}

fn default_gateway_timeout_secs() -> u64 {
    5
}

fn default_provider_timeout_secs() -> u64 {
    15
}

fn default_notification_timeout_secs() -> u64 {
    10
}

fn default_checkout_tx_timeout_secs() -> u64 {
    10
}

fn default_callback_tx_timeout_secs() -> u64 {
    30
}

fn default_purchase_lock_wait_ms() -> u64 {
    5_000
}

fn default_max_concurrent_purchases() -> usize {
    10
}

fn default_fee_methods() -> Vec<String> {
    vec!["NQ".to_string(), "QRIS".to_string()]
}

fn default_fee_rate() -> Decimal {
    Decimal::new(7, 3)
}

fn default_platinum_threshold() -> i64 {
    100_000
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_fee_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate >= Decimal::ONE {
        let mut err = ValidationError::new("fee_rate");
        err.message = Some("fee_rate must be a fraction between 0 and 1".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("topup_api={},tower_http=debug,sea_orm=warn", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // Gateway and provider secrets have no defaults.
    let config = Config::builder()
        .set_default("database_url", "sqlite://topup.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    for key in [
        "duitku.merchant_code",
        "duitku.api_key",
        "digiflazz.username",
        "digiflazz.api_key",
    ] {
        if config.get_string(key).is_err() {
            let env_name = format!("APP__{}", key.replace('.', "__").to_uppercase());
            error!("{} is not configured. Set {}.", key, env_name);
            return Err(AppConfigError::Load(ConfigError::NotFound(format!(
                "{} is required but not configured. Set {}.",
                key, env_name
            ))));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate_all().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
