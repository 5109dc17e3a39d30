use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::services::allocation::AllocationStrategy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_DATABASE_URL: &str = "sqlite://pharma_wms.db?mode=rwc";
const DEFAULT_ALLOCATION_STRATEGY: &str = "FEFO";
const DEFAULT_EXPIRY_WARNING_DAYS: u32 = 90;
const CONFIG_DIR: &str = "config";

/// Distribution lists used by the notification sink.
#[derive(Clone, Debug, Deserialize, Default, PartialEq, Eq)]
pub struct NotificationRecipients {
    /// Quality assurance: QC failures, recalls, expiry warnings
    #[serde(default)]
    pub quality: Vec<String>,
    /// Warehouse operations: picking and shipment events
    #[serde(default)]
    pub warehouse: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Deployment environment (development, staging, production)
    #[validate(length(min = 1))]
    pub environment: String,

    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit JSON formatted logs
    #[serde(default)]
    pub log_json: bool,

    /// Run embedded migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1, max = 1000))]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Attempts per allocation transaction when the store reports contention
    #[serde(default = "default_db_retry_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub db_retry_attempts: u32,
    #[serde(default = "default_db_retry_initial_delay_ms")]
    pub db_retry_initial_delay_ms: u64,
    #[serde(default = "default_db_retry_max_delay_ms")]
    pub db_retry_max_delay_ms: u64,

    /// Capacity of the in-process domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Batch selection order used when a caller does not name a strategy
    #[serde(default = "default_allocation_strategy")]
    #[validate(custom = "validate_allocation_strategy")]
    pub default_allocation_strategy: String,

    #[serde(default)]
    pub notification_recipients: NotificationRecipients,

    /// Look-ahead window for expiring batch warnings
    #[serde(default = "default_expiry_warning_days")]
    #[validate(range(min = 1, max = 3650))]
    pub expiry_warning_days: u32,
}

impl AppConfig {
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            db_retry_attempts: default_db_retry_attempts(),
            db_retry_initial_delay_ms: default_db_retry_initial_delay_ms(),
            db_retry_max_delay_ms: default_db_retry_max_delay_ms(),
            event_channel_capacity: default_event_channel_capacity(),
            default_allocation_strategy: default_allocation_strategy(),
            notification_recipients: NotificationRecipients::default(),
            expiry_warning_days: DEFAULT_EXPIRY_WARNING_DAYS,
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// The configured default strategy. Validation guarantees it parses; an
    /// unvalidated config falls back to FEFO.
    pub fn allocation_strategy(&self) -> AllocationStrategy {
        self.default_allocation_strategy
            .parse()
            .unwrap_or(AllocationStrategy::Fefo)
    }

    /// Pool size must cover the minimum and the retry backoff must grow.
    pub fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();
        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }
        if self.db_retry_initial_delay_ms > self.db_retry_max_delay_ms {
            let mut err = ValidationError::new("db_retry_initial_delay_ms");
            err.message = Some("db_retry_initial_delay_ms cannot exceed db_retry_max_delay_ms".into());
            errors.add("db_retry_initial_delay_ms", err);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

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

fn default_true_bool() -> bool {
    true
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

fn default_db_retry_attempts() -> u32 {
    10
}
fn default_db_retry_initial_delay_ms() -> u64 {
    10
}
fn default_db_retry_max_delay_ms() -> u64 {
    500
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_allocation_strategy() -> String {
    DEFAULT_ALLOCATION_STRATEGY.to_string()
}

fn default_expiry_warning_days() -> u32 {
    DEFAULT_EXPIRY_WARNING_DAYS
}

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

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// SPECIFIC needs a named batch, so it cannot serve as a default.
fn validate_allocation_strategy(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_uppercase().as_str() {
        "FIFO" | "FEFO" | "LIFO" => Ok(()),
        _ => {
            let mut err = ValidationError::new("default_allocation_strategy");
            err.message = Some("Must be one of: FIFO, FEFO, LIFO".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("pharma_wms={},sea_orm=warn", level);
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
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same layering as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("database_url", DEFAULT_DATABASE_URL)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs;
    use tempfile::TempDir;

    fn config_dir_with(filename: &str, content: &str) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join(filename), content).unwrap();
        temp_dir
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "development".into());
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_additional_constraints().is_ok());
        assert_eq!(cfg.allocation_strategy(), AllocationStrategy::Fefo);
        assert!(cfg.is_development());
    }

    #[test]
    fn strategy_must_be_ordering_strategy() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "development".into());
        cfg.default_allocation_strategy = "lifo".into();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.allocation_strategy(), AllocationStrategy::Lifo);

        cfg.default_allocation_strategy = "SPECIFIC".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors
            .field_errors()
            .contains_key("default_allocation_strategy"));
    }

    #[test]
    fn min_connections_cannot_exceed_max() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "production".into());
        cfg.db_min_connections = 20;
        cfg.db_max_connections = 5;
        assert!(cfg.validate_additional_constraints().is_err());
        assert!(cfg.is_production());
    }

    #[test]
    fn retry_backoff_must_not_shrink() {
        let mut cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        cfg.db_retry_initial_delay_ms = 900;
        cfg.db_retry_max_delay_ms = 100;
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.field_errors().contains_key("db_retry_initial_delay_ms"));

        cfg.db_retry_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_file_layer() {
        let dir = config_dir_with(
            "default.toml",
            r#"
                database_url = "postgres://localhost/wms"
                environment = "staging"
                log_level = "debug"
                expiry_warning_days = 30

                [notification_recipients]
                quality = ["qa@example.com"]
            "#,
        );

        let cfg = load_config_from(dir.path()).unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/wms");
        assert_eq!(cfg.environment, "staging");
        assert_eq!(cfg.expiry_warning_days, 30);
        assert_eq!(cfg.notification_recipients.quality, vec!["qa@example.com"]);
        assert!(cfg.notification_recipients.warehouse.is_empty());
        assert_eq!(cfg.db_retry_attempts, 10);
    }

    #[test]
    fn invalid_file_values_fail_validation() {
        let dir = config_dir_with(
            "default.toml",
            r#"
                database_url = "sqlite::memory:"
                environment = "development"
                log_level = "loud"
                event_channel_capacity = 0
            "#,
        );

        let result = load_config_from(dir.path());
        assert_matches!(result, Err(AppConfigError::Validation(errors)) => {
            assert!(errors.field_errors().contains_key("log_level"));
            assert!(errors.field_errors().contains_key("event_channel_capacity"));
        });
    }
}
