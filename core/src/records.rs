//! Persisted record types shared by the storage contract and its callers.

use serde::{Deserialize, Serialize};

/// Lifecycle of a found block in the persistent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// Accepted by the daemon, awaiting confirmations
    Found,
    /// Buried under enough confirmations; rewards are spendable
    Confirmed,
}

impl BlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockStatus::Found => "found",
            BlockStatus::Confirmed => "confirmed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "found" => Some(BlockStatus::Found),
            "confirmed" => Some(BlockStatus::Confirmed),
            _ => None,
        }
    }
}

/// One persisted share row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareRecord {
    /// Miner key `"<address>.<worker>"`
    pub miner_key: String,
    /// Wallet address portion of the key
    pub address: String,
    /// Worker name portion of the key
    pub worker: String,
    pub job_id: String,
    pub extra_nonce2: Option<String>,
    pub ntime: String,
    pub nonce: String,
    pub difficulty: u64,
    pub is_valid: bool,
    pub is_block: bool,
    /// Receive time (ms since epoch)
    pub timestamp: u64,
}

/// One persisted block row; `height` and `hash` are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: String,
    pub previous_hash: String,
    pub merkle_root: String,
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: u64,
    /// Miner key of the share that solved the block
    pub found_by: String,
    pub status: BlockStatus,
    pub created_at: u64,
}

/// One reward row per contributing address per block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRewardRecord {
    pub block_height: u64,
    pub block_hash: String,
    pub miner_address: String,
    /// Full block reward in atomic units
    pub base_reward: u64,
    /// Pool fee taken from the base reward, atomic units
    pub pool_fee: u64,
    /// This miner's credit, atomic units
    pub miner_reward: u64,
    /// Share of the PPLNS window, `0.0..=1.0`
    pub miner_percentage: f64,
    pub timestamp: u64,
}

/// One registered miner (`"<address>.<worker>"` keyed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerRecord {
    pub key: String,
    pub address: String,
    pub worker: String,
    /// Last persisted hashrate estimate, hashes per second
    pub hashrate: f64,
    /// Lifetime accepted share count
    pub shares: u64,
    pub last_seen: u64,
    pub created_at: u64,
}

/// Per-address balance summary, all amounts in atomic units.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub address: String,
    pub confirmed_balance: u64,
    pub unconfirmed_balance: u64,
    pub total_paid: u64,
}
