//! Velora Pool Core
//!
//! This crate implements the pool's coordination logic:
//! - Template polling and validation (`template`)
//! - Job creation, expiry, and broadcast (`job`)
//! - Per-miner difficulty control (`difficulty`)
//! - Hashrate estimation (`hashrate`)
//! - Share validation and block detection (`validator`)
//! - Block submission and recovery (`coordinator`)
//! - PPLNS reward distribution and confirmation (`rewards`)
//!
//! Components communicate through channels rather than back-references:
//! the TemplateManager broadcasts template changes, the JobManager
//! broadcasts jobs, and the ShareValidator hands block solutions to the
//! BlockCoordinator over an mpsc channel.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

pub mod coordinator;
pub mod difficulty;
pub mod hashrate;
pub mod job;
pub mod rewards;
pub mod template;
pub mod validator;

pub use coordinator::{BlockCoordinator, ProcessingHeights};
pub use difficulty::{DifficultyConfig, DifficultyController};
pub use hashrate::{HashrateConfig, HashrateEstimator};
pub use job::JobManager;
pub use rewards::{RewardConfig, RewardSplitter};
pub use template::TemplateManager;
pub use validator::{BlockSolution, ShareError, ShareOutcome, ShareValidator};

/// Server-assigned identifier for a connected miner.
pub type ClientId = u64;

/// Shutdown signal shared by every background task.
///
/// The sender flips the value to `true` once; tasks select on `changed()`.
pub type ShutdownRx = tokio::sync::watch::Receiver<bool>;

/// How the pool derives the hash sent with a daemon block submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubmitHashMode {
    /// Re-derive the hash from the template's canonical timestamp and
    /// difficulty inputs.
    #[default]
    Recompute,
    /// Forward the miner-submitted hash unchanged.
    Forward,
}

/// Mining subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Proof-of-work algorithm tag
    pub algorithm: String,

    /// Difficulty assigned to freshly registered miners
    pub starting_difficulty: u64,

    /// Staleness bound for shares and template expiry, milliseconds
    pub share_timeout_ms: u64,

    /// Retention horizon for persisted shares, seconds
    pub max_share_age_secs: u64,

    /// Chain block-time target, seconds; used for display estimates only
    pub block_time_secs: u64,

    /// Template poll interval, seconds
    pub template_update_interval_secs: u64,

    /// Periodic job regeneration interval, seconds
    pub job_refresh_interval_secs: u64,

    /// Calibration constant for hashrate estimates, H/s per difficulty unit
    pub hashrate_scale: f64,

    /// Submission-hash derivation mode
    pub submit_hash_mode: SubmitHashMode,
}

impl Default for MiningConfig {
    fn default() -> Self {
        MiningConfig {
            algorithm: velora_core::ALGORITHM.to_string(),
            starting_difficulty: 100,
            share_timeout_ms: 300_000,
            max_share_age_secs: 3_600,
            block_time_secs: 60,
            template_update_interval_secs: 30,
            job_refresh_interval_secs: 30,
            hashrate_scale: 0.24,
            submit_hash_mode: SubmitHashMode::Recompute,
        }
    }
}

/// Pool-wide share and block counters.
#[derive(Debug, Default)]
pub struct PoolCounters {
    valid_shares: AtomicU64,
    invalid_shares: AtomicU64,
    stale_shares: AtomicU64,
    blocks_found: AtomicU64,
}

/// Snapshot of the counters for logging and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CountersSnapshot {
    pub valid_shares: u64,
    pub invalid_shares: u64,
    pub stale_shares: u64,
    pub blocks_found: u64,
}

impl PoolCounters {
    pub fn new() -> Self {
        PoolCounters::default()
    }

    pub fn inc_valid(&self) {
        self.valid_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalid(&self) {
        self.invalid_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale(&self) {
        self.stale_shares.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocks_found(&self) {
        self.blocks_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            valid_shares: self.valid_shares.load(Ordering::Relaxed),
            invalid_shares: self.invalid_shares.load(Ordering::Relaxed),
            stale_shares: self.stale_shares.load(Ordering::Relaxed),
            blocks_found: self.blocks_found.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = PoolCounters::new();
        counters.inc_valid();
        counters.inc_valid();
        counters.inc_stale();
        counters.inc_blocks_found();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.valid_shares, 2);
        assert_eq!(snapshot.invalid_shares, 0);
        assert_eq!(snapshot.stale_shares, 1);
        assert_eq!(snapshot.blocks_found, 1);
    }

    #[test]
    fn test_mining_config_defaults() {
        let config = MiningConfig::default();
        assert_eq!(config.algorithm, "velora");
        assert_eq!(config.share_timeout_ms, 300_000);
        assert_eq!(config.submit_hash_mode, SubmitHashMode::Recompute);
    }

    #[test]
    fn test_submit_hash_mode_parses_lowercase() {
        let mode: SubmitHashMode = serde_json::from_str("\"forward\"").unwrap();
        assert_eq!(mode, SubmitHashMode::Forward);
    }
}
