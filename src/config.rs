use serde::Deserialize;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::store::models::SigningBackend;

pub const PUBLIC_NETWORK_PASSPHRASE: &str = "Public Global Stellar Network ; September 2015";
pub const TEST_NETWORK_PASSPHRASE: &str = "Test SDF Network ; September 2015";

/// Smallest base fee the network accepts, in stroops.
pub const MIN_BASE_FEE: u32 = 100;
pub const MIN_CLAIM_INTERVAL_SECS: u64 = 6;
pub const MAX_CHANNEL_ACCOUNTS: usize = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub tenant_id: String,

    // Signing
    pub signing_backend: SigningBackend,
    pub distribution_seed: Option<String>,
    pub distribution_public_key: Option<String>,
    pub custody_url: Option<String>,
    pub custody_timeout_ms: u64,
    pub key_encryption_passphrase: Option<String>,
    pub num_channel_accounts: usize,
    pub channel_starting_balance: String,

    // Network
    pub horizon_url: String,
    pub network_passphrase: String,
    pub network_timeout_ms: u64,
    pub max_base_fee: u32,
    pub fee_bump_multiplier: u32,
    pub max_fee_bumps: i32,

    // Ledger tracker
    pub ledger_horizon: u32,
    pub ledger_ttl_ms: u64,
    pub ledger_refresh_interval_ms: u64,

    // Worker pool
    pub batch_size: usize,
    pub claim_interval_secs: u64,
    pub worker_pool_size: usize,
    pub lease_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    // Sync and sweeps
    pub sync_interval_secs: u64,
    pub sync_batch_size: usize,
    pub inactivity_cancel_days: i64,
    pub cancel_sweep_interval_secs: u64,
}

impl Config {
    /// Environment variables use the `TSS_` prefix, e.g. `TSS_BATCH_SIZE=16`.
    /// `DATABASE_URL` and `BIND_ADDRESS` are honored without the prefix.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .set_default("database_url", "postgresql://localhost/tss")?
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("tenant_id", "default")?
            .set_default("signing_backend", "env")?
            .set_default("custody_timeout_ms", 10_000)?
            .set_default("num_channel_accounts", 1)?
            .set_default("channel_starting_balance", "1.5")?
            .set_default("horizon_url", "https://horizon-testnet.stellar.org")?
            .set_default("network_passphrase", TEST_NETWORK_PASSPHRASE)?
            .set_default("network_timeout_ms", 30_000)?
            .set_default("max_base_fee", MIN_BASE_FEE as i64)?
            .set_default("fee_bump_multiplier", 10)?
            .set_default("max_fee_bumps", 3)?
            .set_default("ledger_horizon", 10)?
            .set_default("ledger_ttl_ms", 5_000)?
            .set_default("ledger_refresh_interval_ms", 2_500)?
            .set_default("batch_size", 8)?
            .set_default("claim_interval_secs", MIN_CLAIM_INTERVAL_SECS as i64)?
            .set_default("worker_pool_size", 4)?
            .set_default("lease_secs", 120)?
            .set_default("backoff_base_ms", 2_000)?
            .set_default("backoff_max_ms", 120_000)?
            .set_default("sync_interval_secs", 10)?
            .set_default("sync_batch_size", 50)?
            .set_default("inactivity_cancel_days", 5)?
            .set_default("cancel_sweep_interval_secs", 3_600)?
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("bind_address", std::env::var("BIND_ADDRESS").ok())?
            .add_source(config::Environment::with_prefix("TSS").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Rejects inconsistent settings. Called once at boot; failure is fatal.
    pub fn validate(&self) -> AppResult<()> {
        if self.network_passphrase != PUBLIC_NETWORK_PASSPHRASE
            && self.network_passphrase != TEST_NETWORK_PASSPHRASE
        {
            return Err(AppError::Fatal(format!(
                "network passphrase {:?} is invalid",
                self.network_passphrase
            )));
        }
        if self.horizon_url.is_empty() {
            return Err(AppError::Fatal("horizon url cannot be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(AppError::Fatal("batch size must be at least 1".into()));
        }
        if self.worker_pool_size == 0 {
            return Err(AppError::Fatal("worker pool size must be at least 1".into()));
        }
        if self.claim_interval_secs < MIN_CLAIM_INTERVAL_SECS {
            return Err(AppError::Fatal(format!(
                "claim interval must be at least {} seconds",
                MIN_CLAIM_INTERVAL_SECS
            )));
        }
        if self.max_base_fee < MIN_BASE_FEE {
            return Err(AppError::Fatal(format!(
                "max base fee must be greater than or equal to {}",
                MIN_BASE_FEE
            )));
        }
        if self.ledger_horizon == 0 {
            return Err(AppError::Fatal("ledger horizon must be at least 1".into()));
        }
        if self.inactivity_cancel_days <= 0 {
            return Err(AppError::Fatal("inactivity cancel days must be positive".into()));
        }

        match self.signing_backend {
            SigningBackend::Env => {
                if self.distribution_seed.is_none() {
                    return Err(AppError::Fatal(
                        "env signing backend requires a distribution seed".into(),
                    ));
                }
            }
            SigningBackend::Pool => {
                if self.key_encryption_passphrase.as_deref().unwrap_or("").is_empty() {
                    return Err(AppError::Fatal(
                        "pool signing backend requires a key encryption passphrase".into(),
                    ));
                }
                if self.distribution_seed.is_none() {
                    return Err(AppError::Fatal(
                        "pool signing backend requires a funding distribution seed".into(),
                    ));
                }
                if self.num_channel_accounts == 0 || self.num_channel_accounts > MAX_CHANNEL_ACCOUNTS {
                    return Err(AppError::Fatal(format!(
                        "num channel accounts must stay in the range from 1 to {}",
                        MAX_CHANNEL_ACCOUNTS
                    )));
                }
            }
            SigningBackend::Custody => {
                if self.custody_url.as_deref().unwrap_or("").is_empty() {
                    return Err(AppError::Fatal("custody signing backend requires a custody url".into()));
                }
                if self.distribution_public_key.is_none() {
                    return Err(AppError::Fatal(
                        "custody signing backend requires a distribution public key".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    pub fn custody_timeout(&self) -> Duration {
        Duration::from_millis(self.custody_timeout_ms)
    }

    pub fn claim_interval(&self) -> Duration {
        Duration::from_secs(self.claim_interval_secs)
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url == "memory"
    }
}
