use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub storage: StorageConfig,
    pub payment: PaymentConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub booking: BookingPolicy,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected pretty or json, got {other}")),
        }
    }
}

// Где живёт реестр мест
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StorageBackend::Postgres),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(format!("expected postgres or memory, got {other}")),
        }
    }
}

// Настройки хранилища
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub pool_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentBackend {
    Http,
    Mock,
}

impl FromStr for PaymentBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(PaymentBackend::Http),
            "mock" => Ok(PaymentBackend::Mock),
            other => Err(format!("expected http or mock, got {other}")),
        }
    }
}

// Настройки платежного шлюза
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentConfig {
    pub backend: PaymentBackend,
    pub merchant_id: String,
    pub merchant_password: String,
    pub gateway_url: String,
    pub currency: String,
    pub timeout_seconds: u64,
}

// Настройки Circuit Breaker
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

/// Политика броней: окно удержания, частота уборщика, лимиты.
#[derive(Debug, Clone, Deserialize)]
pub struct BookingPolicy {
    pub hold_duration_seconds: i64,
    pub sweep_interval_seconds: u64,
    pub sweep_batch_size: usize,
    pub sweep_concurrency: usize,
    pub max_seats_per_hold: usize,
    pub booking_code_prefix: String,
    pub booking_code_attempts: u32,
}

impl BookingPolicy {
    pub fn hold_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hold_duration_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hold_duration_seconds: 300,
            sweep_interval_seconds: 30,
            sweep_batch_size: 500,
            sweep_concurrency: 8,
            max_seats_per_hold: 10,
            booking_code_prefix: "BK".to_string(),
            booking_code_attempts: 5,
        }
    }
}

fn var_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let value = var_or(name, default);
    value.parse().map_err(|e: T::Err| ConfigError::Invalid {
        name,
        value,
        reason: e.to_string(),
    })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = BookingPolicy::default();

        let config = Config {
            app: AppConfig {
                host: var_or("HOST", "0.0.0.0"),
                port: parse_var("PORT", "8000")?,
                environment: var_or("ENVIRONMENT", "development"),
                rust_log: var_or("RUST_LOG", "cinema_booking=debug,tower_http=debug"),
                log_format: parse_var("LOG_FORMAT", "pretty")?,
            },
            storage: StorageConfig {
                backend: parse_var("STORAGE_BACKEND", "postgres")?,
                database_url: env::var("DATABASE_URL").ok(),
                pool_size: parse_var("DB_POOL_SIZE", "20")?,
            },
            payment: PaymentConfig {
                backend: parse_var("PAYMENT_BACKEND", "http")?,
                merchant_id: var_or("MERCHANT_ID", ""),
                merchant_password: var_or("MERCHANT_PASSWORD", ""),
                gateway_url: var_or("PAYMENT_GATEWAY_URL", "https://gateway.example.com"),
                currency: var_or("PAYMENT_CURRENCY", "KZT"),
                timeout_seconds: parse_var("PAYMENT_TIMEOUT_SECONDS", "30")?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: parse_var("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "5")?,
                timeout_seconds: parse_var("CIRCUIT_BREAKER_TIMEOUT_SECONDS", "60")?,
            },
            booking: BookingPolicy {
                hold_duration_seconds: parse_var(
                    "HOLD_DURATION_SECONDS",
                    &defaults.hold_duration_seconds.to_string(),
                )?,
                sweep_interval_seconds: parse_var(
                    "SWEEP_INTERVAL_SECONDS",
                    &defaults.sweep_interval_seconds.to_string(),
                )?,
                sweep_batch_size: parse_var("SWEEP_BATCH_SIZE", &defaults.sweep_batch_size.to_string())?,
                sweep_concurrency: parse_var("SWEEP_CONCURRENCY", &defaults.sweep_concurrency.to_string())?,
                max_seats_per_hold: parse_var(
                    "MAX_SEATS_PER_HOLD",
                    &defaults.max_seats_per_hold.to_string(),
                )?,
                booking_code_prefix: var_or("BOOKING_CODE_PREFIX", &defaults.booking_code_prefix),
                booking_code_attempts: parse_var(
                    "BOOKING_CODE_ATTEMPTS",
                    &defaults.booking_code_attempts.to_string(),
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }
        if self.payment.backend == PaymentBackend::Http {
            if self.payment.merchant_id.is_empty() {
                return Err(ConfigError::Missing("MERCHANT_ID"));
            }
            if self.payment.merchant_password.is_empty() {
                return Err(ConfigError::Missing("MERCHANT_PASSWORD"));
            }
        }

        let policy = &self.booking;
        if policy.hold_duration_seconds <= 0 {
            return Err(invalid("HOLD_DURATION_SECONDS", policy.hold_duration_seconds, "must be positive"));
        }
        if policy.sweep_interval_seconds == 0 {
            return Err(invalid("SWEEP_INTERVAL_SECONDS", 0, "must be positive"));
        }
        if policy.sweep_batch_size == 0 || policy.sweep_concurrency == 0 {
            return Err(invalid("SWEEP_BATCH_SIZE/SWEEP_CONCURRENCY", 0, "must be positive"));
        }
        if policy.max_seats_per_hold == 0 {
            return Err(invalid("MAX_SEATS_PER_HOLD", 0, "must be positive"));
        }
        if policy.booking_code_prefix.len() != 2
            || !policy.booking_code_prefix.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(invalid(
                "BOOKING_CODE_PREFIX",
                &policy.booking_code_prefix,
                "must be two uppercase ASCII letters",
            ));
        }
        if policy.booking_code_attempts == 0 {
            return Err(invalid("BOOKING_CODE_ATTEMPTS", 0, "must be positive"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
