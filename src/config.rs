//! Layered configuration: TOML file plus `VELORA_*` environment
//! variables, deserialized into each subsystem's own config struct.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use velora_core::coins_to_atomic;
use velora_daemon::DaemonConfig;
use velora_mining::{HashrateConfig, MiningConfig, RewardConfig};
use velora_stratum::StratumConfig;

/// Pool identity and economics.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// P2PKH payout address; validated fatally at startup
    pub pool_address: String,

    /// Pool fee fraction, `0.0..1.0`
    pub fee: f64,

    /// Minimum payout threshold in coins (consumed by the payout
    /// processor; carried in the leaderboard contract)
    pub min_payout: f64,

    /// Fixed block reward in coins
    pub block_reward: f64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            pool_address: String::new(),
            fee: 0.01,
            min_payout: 1.0,
            block_reward: 50.0,
        }
    }
}

/// Persistence selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database path; in-memory accounting when unset
    pub database_path: Option<PathBuf>,
}

/// Full process configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub stratum: StratumConfig,
    pub daemon: DaemonConfig,
    pub mining: MiningConfig,
    pub pool: PoolSettings,
    pub storage: StorageSettings,
}

impl Settings {
    /// Loads the configuration file (explicit path, or `velora-pool.toml`
    /// beside the process when present) and overlays `VELORA_*`
    /// environment variables (`VELORA_STRATUM__PORT=3334` style).
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("velora-pool").required(false)),
        };

        builder = builder.add_source(
            config::Environment::with_prefix("VELORA")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reward tuning derived from the pool economics section.
    pub fn reward_config(&self) -> RewardConfig {
        RewardConfig {
            block_reward_atomic: coins_to_atomic(self.pool.block_reward),
            fee: self.pool.fee,
            share_retention_secs: self.mining.max_share_age_secs,
            ..Default::default()
        }
    }

    /// Hashrate estimator tuning derived from the mining section.
    pub fn hashrate_config(&self) -> HashrateConfig {
        HashrateConfig {
            scale: self.mining.hashrate_scale,
            ..Default::default()
        }
    }
}
