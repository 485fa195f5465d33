//! Core Types and Data Structures for the Velora Mining Pool
//!
//! This module defines the fundamental data structures shared across the
//! pool: block templates, miner-facing jobs, share submissions, persisted
//! records, 256-bit target arithmetic, and pool address validation.

use thiserror::Error;

pub mod address;
pub mod job;
pub mod records;
pub mod share;
pub mod target;
pub mod template;

/// Re-export core types
pub use address::validate_pool_address;
pub use job::Job;
pub use records::{
    BlockRecord, BlockRewardRecord, BlockStatus, LeaderboardEntry, MinerRecord, ShareRecord,
};
pub use share::Share;
pub use target::{meets_difficulty, parse_hash, target_for_difficulty, to_hash_hex, U256};
pub use template::{derive_pool_difficulty, Template, MIN_POOL_DIFFICULTY};

/// Smallest integer denomination of the currency, per whole coin.
///
/// All persisted balances and rewards use atomic units to avoid
/// floating-point drift.
pub const ATOMIC_UNITS: u64 = 100_000_000;

/// Proof-of-work algorithm tag carried on jobs and block submissions.
pub const ALGORITHM: &str = "velora";

/// Converts a coin-denominated amount to atomic units, rounding to the
/// nearest unit.
pub fn coins_to_atomic(coins: f64) -> u64 {
    (coins * ATOMIC_UNITS as f64).round() as u64
}

/// Converts atomic units back to a coin-denominated display amount.
pub fn atomic_to_coins(atomic: u64) -> f64 {
    atomic as f64 / ATOMIC_UNITS as f64
}

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid share field: {0}")]
    InvalidShare(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_atomic() {
        assert_eq!(coins_to_atomic(1.0), 100_000_000);
        assert_eq!(coins_to_atomic(14.85), 1_485_000_000);
        assert_eq!(coins_to_atomic(0.0), 0);
    }

    #[test]
    fn test_atomic_to_coins() {
        assert!((atomic_to_coins(4_950_000_000) - 49.5).abs() < 1e-9);
    }
}
