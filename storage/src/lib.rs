//! Persistent Store Contract for the Velora Mining Pool
//!
//! This module defines the durable operations the pool core invokes:
//! miner registration, share and block persistence, reward rows, and
//! leaderboard balances. The default implementation is in-memory; the
//! `velora-database` crate provides the SQLite-backed one.
//!
//! Store failures are never surfaced to miners; callers log and continue
//! with in-memory accounting.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use velora_core::{
    parse_hash, BlockRecord, BlockRewardRecord, BlockStatus, LeaderboardEntry, MinerRecord,
    ShareRecord,
};

pub mod memory;

pub use memory::MemoryStore;

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Builds the miner table key from a wallet address and worker name.
pub fn miner_key(address: &str, worker: &str) -> String {
    format!("{}.{}", address, worker)
}

/// Durable operations invoked by the pool core.
///
/// Implementations serialize concurrent callers internally; the core never
/// holds its own locks across these calls.
#[async_trait]
pub trait Store: Send + Sync {
    /// Registers (or re-registers) a miner keyed by `"<address>.<worker>"`.
    async fn register_miner(&self, address: &str, worker: &str)
        -> Result<MinerRecord, StorageError>;

    /// Gets a miner row.
    async fn get_miner(&self, key: &str) -> Result<MinerRecord, StorageError>;

    /// Updates the periodic miner stats snapshot.
    async fn update_miner_stats(
        &self,
        key: &str,
        hashrate: f64,
        shares: u64,
        last_seen: u64,
    ) -> Result<(), StorageError>;

    /// Appends one share row.
    async fn record_share(&self, share: ShareRecord) -> Result<(), StorageError>;

    /// All shares received at or after `since_ms` (PPLNS window input).
    async fn shares_since(&self, since_ms: u64) -> Result<Vec<ShareRecord>, StorageError>;

    /// Drops share rows older than `before_ms`.
    async fn prune_shares_before(&self, before_ms: u64) -> Result<u64, StorageError>;

    /// Inserts a found block, deduping by height.
    ///
    /// A numerically lower (better) hash replaces an existing row for the
    /// same height; otherwise the insert is a no-op. Returns whether the
    /// row was written.
    async fn insert_block(&self, block: BlockRecord) -> Result<bool, StorageError>;

    /// Gets the block row at a height.
    async fn get_block(&self, height: u64) -> Result<BlockRecord, StorageError>;

    /// All blocks with the given status, ascending by height.
    async fn blocks_by_status(&self, status: BlockStatus)
        -> Result<Vec<BlockRecord>, StorageError>;

    /// Updates a block's status.
    async fn set_block_status(&self, height: u64, status: BlockStatus)
        -> Result<(), StorageError>;

    /// Appends reward rows for a distributed block.
    async fn insert_rewards(&self, rewards: Vec<BlockRewardRecord>) -> Result<(), StorageError>;

    /// Rebuilds every leaderboard balance from the reward rows.
    ///
    /// Confirmed balances sum rewards of `Confirmed` blocks, unconfirmed
    /// balances sum the rest. Always a full recomputation, never an
    /// increment, so running it twice is idempotent.
    async fn recompute_balances(&self) -> Result<(), StorageError>;

    /// Reads one leaderboard row (zeroed if the address has no rewards).
    async fn leaderboard_entry(&self, address: &str) -> Result<LeaderboardEntry, StorageError>;

    /// Flushes any buffered state; called once during shutdown.
    async fn flush(&self) -> Result<(), StorageError>;
}

/// Compares two block hashes as 256-bit integers; `true` when `candidate`
/// is strictly better (lower) than `current`.
pub fn is_better_hash(candidate: &str, current: &str) -> bool {
    match (parse_hash(candidate), parse_hash(current)) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

/// Recomputes leaderboard balances from reward rows and block statuses.
///
/// Shared by the memory and SQLite stores so both implement the same
/// never-incremental rule.
pub fn rebuild_balances(
    rewards: &[BlockRewardRecord],
    status_of: &HashMap<u64, BlockStatus>,
    previous: &HashMap<String, LeaderboardEntry>,
) -> HashMap<String, LeaderboardEntry> {
    let mut rebuilt: HashMap<String, LeaderboardEntry> = HashMap::new();

    for reward in rewards {
        let entry = rebuilt
            .entry(reward.miner_address.clone())
            .or_insert_with(|| LeaderboardEntry {
                address: reward.miner_address.clone(),
                total_paid: previous
                    .get(&reward.miner_address)
                    .map(|e| e.total_paid)
                    .unwrap_or(0),
                ..Default::default()
            });

        match status_of.get(&reward.block_height) {
            Some(BlockStatus::Confirmed) => entry.confirmed_balance += reward.miner_reward,
            _ => entry.unconfirmed_balance += reward.miner_reward,
        }
    }

    rebuilt
}

/// Shared in-memory index used by [`MemoryStore`]; kept here so tests can
/// exercise the balance rebuild rule without a store instance.
pub(crate) type Table<T> = RwLock<T>;
