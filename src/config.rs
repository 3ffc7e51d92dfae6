use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub transfer_api_url: String,
    pub transfer_api_secret: String,
    /// Platform commission deducted at release time (fraction, e.g. 0.05).
    pub commission_rate: Decimal,
    /// Hours after the delivery deadline during which buyers may still dispute.
    pub grace_period_hours: i64,
    pub scan_interval_secs: u64,
    /// Attempt budget for retryable release failures before escalation.
    pub max_release_attempts: u32,
    pub retry_backoff_secs: u64,
    pub transfer_timeout_secs: u64,
    /// Dispute ratio at which a partial hold kicks in (inclusive).
    pub partial_hold_threshold: Decimal,
    /// Dispute ratio at which the full available balance is withheld (inclusive).
    pub full_hold_threshold: Decimal,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/escrow".to_string()),
            transfer_api_url: std::env::var("TRANSFER_API_URL")
                .unwrap_or_else(|_| "https://api.paystack.co".to_string()),
            transfer_api_secret: std::env::var("TRANSFER_API_SECRET").unwrap_or_default(),
            commission_rate: decimal_env("COMMISSION_RATE", dec!(0.05))?,
            grace_period_hours: int_env("GRACE_PERIOD_HOURS", 48)?,
            scan_interval_secs: int_env("SCAN_INTERVAL_SECS", 300)?,
            max_release_attempts: int_env("MAX_RELEASE_ATTEMPTS", 3)?,
            retry_backoff_secs: int_env("RETRY_BACKOFF_SECS", 30)?,
            transfer_timeout_secs: int_env("TRANSFER_TIMEOUT_SECS", 15)?,
            partial_hold_threshold: decimal_env("PARTIAL_HOLD_THRESHOLD", dec!(0.25))?,
            full_hold_threshold: decimal_env("FULL_HOLD_THRESHOLD", dec!(0.60))?,
        })
    }
}

fn decimal_env(key: &str, default: Decimal) -> Result<Decimal, config::ConfigError> {
    match std::env::var(key) {
        Ok(raw) => Decimal::from_str(&raw)
            .map_err(|e| config::ConfigError::Message(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

fn int_env<T: FromStr>(key: &str, default: T) -> Result<T, config::ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| config::ConfigError::Message(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}
