//! Configuration management for the storefront server.
//!
//! Loads configuration from environment variables (after `.env`, if present)
//! with defaults for everything except the database URL and the JWT secret.
//! A payment provider is configured only when all of its credentials are set.

use std::env;
use std::time::Duration;
use storefront_payments::{AlipayConfig, WechatPayConfig, alipay, wechat};
use storefront_postgres::PoolSettings;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set but unusable.
    #[error("Invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name
        key: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// `PostgreSQL`
    pub database: DatabaseConfig,
    /// Reservation and payment lifecycle
    pub lifecycle: LifecycleConfig,
    /// Bearer tokens
    pub auth: AuthConfig,
    /// Alipay credentials, `None` when not configured
    pub alipay: Option<AlipayConfig>,
    /// WeChat Pay credentials, `None` when not configured
    pub wechat: Option<WechatPayConfig>,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
    /// How long in-flight requests and jobs get to finish on shutdown
    pub shutdown_timeout: Duration,
}

/// `PostgreSQL` configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,
    /// Pool sizing and timeouts
    pub pool: PoolSettings,
    /// Apply embedded migrations at startup
    pub run_migrations: bool,
}

/// Timers of the order and payment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// How long an unpaid order holds its stock
    pub reservation_window: chrono::Duration,
    /// How long a payment may stay pending
    pub payment_timeout: chrono::Duration,
    /// Expiry sweeper period
    pub sweeper_interval: Duration,
    /// Payment timeout reaper period
    pub reaper_interval: Duration,
    /// Rows per job batch
    pub job_batch_size: usize,
}

/// Bearer token configuration
#[derive(Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// HS256 secret
    pub jwt_secret: String,
    /// Token lifetime
    pub token_ttl: chrono::Duration,
    /// Renew tokens expiring sooner than this
    pub refresh_threshold: chrono::Duration,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_ttl", &self.token_ttl)
            .field("refresh_threshold", &self.refresh_threshold)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is the normal production case.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);
        Ok(Self {
            server: ServerConfig {
                host: vars.or("HOST", "0.0.0.0"),
                port: vars.parsed("PORT", 8888)?,
                metrics_enabled: vars.parsed("METRICS_ENABLED", true)?,
                shutdown_timeout: Duration::from_secs(vars.parsed("SHUTDOWN_TIMEOUT", 10)?),
            },
            database: DatabaseConfig {
                url: vars.required("DATABASE_URL")?,
                pool: PoolSettings {
                    max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS", 10)?,
                    min_connections: vars.parsed("DATABASE_MIN_CONNECTIONS", 2)?,
                    connect_timeout: Duration::from_secs(
                        vars.parsed("DATABASE_CONNECT_TIMEOUT", 30)?,
                    ),
                },
                run_migrations: vars.parsed("DATABASE_RUN_MIGRATIONS", true)?,
            },
            lifecycle: LifecycleConfig {
                reservation_window: chrono::Duration::seconds(
                    vars.parsed("ORDER_RESERVATION_WINDOW_SECS", 1800)?,
                ),
                payment_timeout: chrono::Duration::seconds(
                    vars.parsed("PAYMENT_TIMEOUT_SECS", 900)?,
                ),
                sweeper_interval: Duration::from_secs(vars.parsed("SWEEPER_INTERVAL_SECS", 60)?),
                reaper_interval: Duration::from_secs(vars.parsed("REAPER_INTERVAL_SECS", 15)?),
                job_batch_size: vars.parsed("JOB_BATCH_SIZE", 100)?,
            },
            auth: AuthConfig {
                jwt_secret: vars.required("JWT_SECRET")?,
                token_ttl: chrono::Duration::seconds(vars.parsed("JWT_TTL_SECS", 86_400)?),
                refresh_threshold: chrono::Duration::seconds(
                    vars.parsed("JWT_REFRESH_THRESHOLD_SECS", 43_200)?,
                ),
            },
            alipay: alipay_config(&vars),
            wechat: wechat_config(&vars)?,
        })
    }
}

fn alipay_config(vars: &Vars<'_>) -> Option<AlipayConfig> {
    Some(AlipayConfig {
        app_id: vars.get("ALIPAY_APP_ID")?,
        private_key: vars.get("ALIPAY_PRIVATE_KEY")?,
        alipay_public_key: vars.get("ALIPAY_PUBLIC_KEY")?,
        gateway: vars.or("ALIPAY_GATEWAY", alipay::DEFAULT_GATEWAY),
        notify_url: vars.get("ALIPAY_NOTIFY_URL")?,
        return_url: vars.get("ALIPAY_RETURN_URL"),
    })
}

fn wechat_config(vars: &Vars<'_>) -> Result<Option<WechatPayConfig>, ConfigError> {
    let qr_expiry = chrono::Duration::seconds(vars.parsed("WECHAT_QR_EXPIRY_SECS", 600)?);
    Ok(wechat_credentials(vars, qr_expiry))
}

fn wechat_credentials(vars: &Vars<'_>, qr_expiry: chrono::Duration) -> Option<WechatPayConfig> {
    Some(WechatPayConfig {
        app_id: vars.get("WECHAT_APP_ID")?,
        mch_id: vars.get("WECHAT_MCH_ID")?,
        mch_serial_no: vars.get("WECHAT_MCH_SERIAL_NO")?,
        private_key: vars.get("WECHAT_PRIVATE_KEY")?,
        api_v3_key: vars.get("WECHAT_API_V3_KEY")?,
        platform_public_key: vars.get("WECHAT_PLATFORM_PUBLIC_KEY")?,
        base_url: vars.or("WECHAT_BASE_URL", wechat::DEFAULT_BASE_URL),
        notify_url: vars.get("WECHAT_NOTIFY_URL")?,
        qr_expiry,
    })
}

/// Environment reader; empty values count as unset.
struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key).map_or(Ok(default), |raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                reason: e.to_string(),
            })
        })
    }
}
