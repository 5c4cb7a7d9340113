//! # Checkout Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     BAZAAR_DATABASE_PATH=/var/lib/bazaar/bazaar.db                     │
//! │     BAZAAR_TAX_RATE_BPS=2000                                           │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/bazaar/checkout.toml (Linux)                             │
//! │     ~/Library/Application Support/com.bazaar.bazaar/checkout.toml      │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # checkout.toml
//! [database]
//! path = "./bazaar.db"
//! max_connections = 8
//!
//! [finance]
//! tax_rate_bps = 2000        # 20%
//! commission_rate_bps = 1000 # 10%
//! currency = "USD"
//! escrow_days = 7
//!
//! [reservations]
//! checkout_ttl_secs = 1800
//!
//! [sweeper]
//! interval_secs = 60
//! batch_limit = 500
//! ```

use std::path::PathBuf;
use std::time::Duration;

use bazaar_core::finance::FinancialConfig;
use bazaar_core::validation::{validate_currency, validate_escrow_days, validate_rate};
use bazaar_core::{Rate, CHECKOUT_RESERVATION_TTL_SECS, DEFAULT_ESCROW_DAYS, MAX_RESERVATION_TTL_SECS};
use bazaar_db::DbConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CheckoutError, CheckoutResult};

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./bazaar.db")
}

fn default_max_connections() -> u32 {
    8
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    pub fn db_config(&self) -> DbConfig {
        DbConfig::new(&self.path).max_connections(self.max_connections)
    }
}

// =============================================================================
// Finance Settings
// =============================================================================

/// Platform rates in basis points (1 bps = 0.01%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinanceSettings {
    #[serde(default)]
    pub tax_rate_bps: u32,

    #[serde(default)]
    pub commission_rate_bps: u32,

    #[serde(default = "default_currency")]
    pub currency: String,

    #[serde(default = "default_escrow_days")]
    pub escrow_days: i64,
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_escrow_days() -> i64 {
    DEFAULT_ESCROW_DAYS
}

impl Default for FinanceSettings {
    fn default() -> Self {
        FinanceSettings {
            tax_rate_bps: 0,
            commission_rate_bps: 0,
            currency: default_currency(),
            escrow_days: default_escrow_days(),
        }
    }
}

// =============================================================================
// Reservation Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSettings {
    /// Hold placed on each order line until payment is confirmed.
    #[serde(default = "default_checkout_ttl")]
    pub checkout_ttl_secs: u64,
}

fn default_checkout_ttl() -> u64 {
    CHECKOUT_RESERVATION_TTL_SECS as u64
}

impl Default for ReservationSettings {
    fn default() -> Self {
        ReservationSettings {
            checkout_ttl_secs: default_checkout_ttl(),
        }
    }
}

// =============================================================================
// Sweeper Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperSettings {
    /// Seconds between sweeps.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Maximum reservations expired per sweep.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_batch_limit() -> u32 {
    500
}

impl Default for SweeperSettings {
    fn default() -> Self {
        SweeperSettings {
            interval_secs: default_sweep_interval(),
            batch_limit: default_batch_limit(),
        }
    }
}

// =============================================================================
// Main Checkout Configuration
// =============================================================================

/// Complete checkout configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub finance: FinanceSettings,

    #[serde(default)]
    pub reservations: ReservationSettings,

    #[serde(default)]
    pub sweeper: SweeperSettings,
}

impl CheckoutConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (checkout.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> CheckoutResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading checkout config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parses a TOML document without consulting the environment.
    pub fn from_toml(contents: &str) -> CheckoutResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CheckoutResult<()> {
        validate_rate("tax_rate_bps", Rate::from_bps(self.finance.tax_rate_bps))
            .map_err(|e| CheckoutError::InvalidConfig(e.to_string()))?;
        validate_rate(
            "commission_rate_bps",
            Rate::from_bps(self.finance.commission_rate_bps),
        )
        .map_err(|e| CheckoutError::InvalidConfig(e.to_string()))?;
        validate_currency(&self.finance.currency)
            .map_err(|e| CheckoutError::InvalidConfig(e.to_string()))?;

        validate_escrow_days(self.finance.escrow_days)
            .map_err(|e| CheckoutError::InvalidConfig(e.to_string()))?;
        if self.reservations.checkout_ttl_secs == 0
            || self.reservations.checkout_ttl_secs > MAX_RESERVATION_TTL_SECS as u64
        {
            return Err(CheckoutError::InvalidConfig(format!(
                "checkout_ttl_secs must be between 1 and {}",
                MAX_RESERVATION_TTL_SECS
            )));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(CheckoutError::InvalidConfig(
                "sweeper interval_secs must be greater than 0".into(),
            ));
        }
        if self.sweeper.batch_limit == 0 {
            return Err(CheckoutError::InvalidConfig(
                "sweeper batch_limit must be greater than 0".into(),
            ));
        }
        if self.database.max_connections == 0 {
            return Err(CheckoutError::InvalidConfig(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("BAZAAR_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(max) = env_parse::<u32>("BAZAAR_MAX_CONNECTIONS") {
            self.database.max_connections = max;
        }

        if let Some(bps) = env_parse::<u32>("BAZAAR_TAX_RATE_BPS") {
            debug!(bps, "Overriding tax rate from environment");
            self.finance.tax_rate_bps = bps;
        }

        if let Some(bps) = env_parse::<u32>("BAZAAR_COMMISSION_RATE_BPS") {
            debug!(bps, "Overriding commission rate from environment");
            self.finance.commission_rate_bps = bps;
        }

        if let Ok(currency) = std::env::var("BAZAAR_CURRENCY") {
            self.finance.currency = currency.to_uppercase();
        }

        if let Some(days) = env_parse::<i64>("BAZAAR_ESCROW_DAYS") {
            self.finance.escrow_days = days;
        }

        if let Some(secs) = env_parse::<u64>("BAZAAR_CHECKOUT_TTL_SECS") {
            self.reservations.checkout_ttl_secs = secs;
        }

        if let Some(secs) = env_parse::<u64>("BAZAAR_SWEEP_INTERVAL_SECS") {
            self.sweeper.interval_secs = secs;
        }

        if let Some(limit) = env_parse::<u32>("BAZAAR_SWEEP_BATCH_LIMIT") {
            self.sweeper.batch_limit = limit;
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "bazaar", "bazaar")
            .map(|dirs| dirs.config_dir().join("checkout.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn financial_config(&self) -> FinancialConfig {
        FinancialConfig::new(
            Rate::from_bps(self.finance.tax_rate_bps),
            Rate::from_bps(self.finance.commission_rate_bps),
            self.finance.currency.clone(),
        )
        .with_escrow_days(self.finance.escrow_days)
    }

    pub fn checkout_ttl(&self) -> Duration {
        Duration::from_secs(self.reservations.checkout_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_secs)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
