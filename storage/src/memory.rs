//! In-memory store implementation.
//!
//! Used in tests and for pools run without a database path. State layout
//! mirrors the SQLite schema one table per field.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;

use velora_core::{
    BlockRecord, BlockRewardRecord, BlockStatus, LeaderboardEntry, MinerRecord, ShareRecord,
};
use velora_util::now_ms;

use crate::{is_better_hash, miner_key, rebuild_balances, Store, StorageError, Table};

/// Memory-backed store.
#[derive(Default)]
pub struct MemoryStore {
    miners: Table<HashMap<String, MinerRecord>>,
    shares: Table<Vec<ShareRecord>>,
    blocks: Table<HashMap<u64, BlockRecord>>,
    rewards: Table<Vec<BlockRewardRecord>>,
    leaderboard: Table<HashMap<String, LeaderboardEntry>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_miner(
        &self,
        address: &str,
        worker: &str,
    ) -> Result<MinerRecord, StorageError> {
        let key = miner_key(address, worker);
        let now = now_ms();

        let mut miners = self.miners.write().await;
        let record = miners.entry(key.clone()).or_insert_with(|| MinerRecord {
            key,
            address: address.to_string(),
            worker: worker.to_string(),
            hashrate: 0.0,
            shares: 0,
            last_seen: now,
            created_at: now,
        });
        record.last_seen = now;

        Ok(record.clone())
    }

    async fn get_miner(&self, key: &str) -> Result<MinerRecord, StorageError> {
        self.miners
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("Miner not found: {}", key)))
    }

    async fn update_miner_stats(
        &self,
        key: &str,
        hashrate: f64,
        shares: u64,
        last_seen: u64,
    ) -> Result<(), StorageError> {
        let mut miners = self.miners.write().await;
        let record = miners
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(format!("Miner not found: {}", key)))?;

        record.hashrate = hashrate;
        record.shares = shares;
        record.last_seen = last_seen;

        Ok(())
    }

    async fn record_share(&self, share: ShareRecord) -> Result<(), StorageError> {
        self.shares.write().await.push(share);
        Ok(())
    }

    async fn shares_since(&self, since_ms: u64) -> Result<Vec<ShareRecord>, StorageError> {
        Ok(self
            .shares
            .read()
            .await
            .iter()
            .filter(|s| s.timestamp >= since_ms)
            .cloned()
            .collect())
    }

    async fn prune_shares_before(&self, before_ms: u64) -> Result<u64, StorageError> {
        let mut shares = self.shares.write().await;
        let before_len = shares.len();
        shares.retain(|s| s.timestamp >= before_ms);
        Ok((before_len - shares.len()) as u64)
    }

    async fn insert_block(&self, block: BlockRecord) -> Result<bool, StorageError> {
        let mut blocks = self.blocks.write().await;

        let should_write = match blocks.get(&block.height) {
            Some(existing) => is_better_hash(&block.hash, &existing.hash),
            None => true,
        };

        if !should_write {
            debug!(
                "Block at height {} already recorded with an equal or better hash",
                block.height
            );
            return Ok(false);
        }

        blocks.insert(block.height, block);
        Ok(true)
    }

    async fn get_block(&self, height: u64) -> Result<BlockRecord, StorageError> {
        self.blocks
            .read()
            .await
            .get(&height)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("Block at height {} not found", height)))
    }

    async fn blocks_by_status(
        &self,
        status: BlockStatus,
    ) -> Result<Vec<BlockRecord>, StorageError> {
        let mut matching: Vec<BlockRecord> = self
            .blocks
            .read()
            .await
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|b| b.height);
        Ok(matching)
    }

    async fn set_block_status(
        &self,
        height: u64,
        status: BlockStatus,
    ) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write().await;
        let block = blocks
            .get_mut(&height)
            .ok_or_else(|| StorageError::NotFound(format!("Block at height {} not found", height)))?;

        block.status = status;
        Ok(())
    }

    async fn insert_rewards(&self, rewards: Vec<BlockRewardRecord>) -> Result<(), StorageError> {
        self.rewards.write().await.extend(rewards);
        Ok(())
    }

    async fn recompute_balances(&self) -> Result<(), StorageError> {
        let rewards = self.rewards.read().await;
        let status_of: HashMap<u64, BlockStatus> = self
            .blocks
            .read()
            .await
            .iter()
            .map(|(height, block)| (*height, block.status))
            .collect();

        let mut leaderboard = self.leaderboard.write().await;
        let rebuilt = rebuild_balances(&rewards, &status_of, &leaderboard);
        *leaderboard = rebuilt;

        Ok(())
    }

    async fn leaderboard_entry(&self, address: &str) -> Result<LeaderboardEntry, StorageError> {
        Ok(self
            .leaderboard
            .read()
            .await
            .get(address)
            .cloned()
            .unwrap_or_else(|| LeaderboardEntry {
                address: address.to_string(),
                ..Default::default()
            }))
    }

    async fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64, hash: &str) -> BlockRecord {
        BlockRecord {
            height,
            hash: hash.to_string(),
            previous_hash: "00".repeat(32),
            merkle_root: "11".repeat(32),
            timestamp: 1_000,
            nonce: 42,
            difficulty: 1_000_000,
            found_by: "1Addr.rig1".to_string(),
            status: BlockStatus::Found,
            created_at: 1_000,
        }
    }

    fn share(ts: u64) -> ShareRecord {
        ShareRecord {
            miner_key: "1Addr.rig1".to_string(),
            address: "1Addr".to_string(),
            worker: "rig1".to_string(),
            job_id: "01".to_string(),
            extra_nonce2: None,
            ntime: "65a0cf00".to_string(),
            nonce: "deadbeef".to_string(),
            difficulty: 1000,
            is_valid: true,
            is_block: false,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn test_register_miner_is_upsert() {
        let store = MemoryStore::new();
        let first = store.register_miner("1Addr", "rig1").await.unwrap();
        let second = store.register_miner("1Addr", "rig1").await.unwrap();

        assert_eq!(first.key, "1Addr.rig1");
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_block_dedupe_by_height() {
        let store = MemoryStore::new();
        let worse = format!("{}{}", "0".repeat(60), "ffff");
        let better = format!("{}{}", "0".repeat(60), "000f");

        assert!(store.insert_block(block(5, &worse)).await.unwrap());
        // Same height, worse hash: no-op.
        assert!(!store.insert_block(block(5, &worse)).await.unwrap());
        // Same height, better hash: replaces.
        assert!(store.insert_block(block(5, &better)).await.unwrap());

        let stored = store.get_block(5).await.unwrap();
        assert_eq!(stored.hash, better);
    }

    #[tokio::test]
    async fn test_shares_window_and_prune() {
        let store = MemoryStore::new();
        store.record_share(share(1_000)).await.unwrap();
        store.record_share(share(2_000)).await.unwrap();
        store.record_share(share(3_000)).await.unwrap();

        assert_eq!(store.shares_since(2_000).await.unwrap().len(), 2);

        let pruned = store.prune_shares_before(2_000).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.shares_since(0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_confirmation_moves_balances() {
        let store = MemoryStore::new();
        store
            .insert_block(block(1, &"0f".repeat(32)))
            .await
            .unwrap();
        store
            .insert_rewards(vec![BlockRewardRecord {
                block_height: 1,
                block_hash: "0f".repeat(32),
                miner_address: "1Addr".to_string(),
                base_reward: 5_000_000_000,
                pool_fee: 50_000_000,
                miner_reward: 1_485_000_000,
                miner_percentage: 0.3,
                timestamp: 0,
            }])
            .await
            .unwrap();

        store.recompute_balances().await.unwrap();
        let entry = store.leaderboard_entry("1Addr").await.unwrap();
        assert_eq!(entry.unconfirmed_balance, 1_485_000_000);
        assert_eq!(entry.confirmed_balance, 0);

        store
            .set_block_status(1, BlockStatus::Confirmed)
            .await
            .unwrap();
        store.recompute_balances().await.unwrap();
        // Run twice: recomputation must be idempotent.
        store.recompute_balances().await.unwrap();

        let entry = store.leaderboard_entry("1Addr").await.unwrap();
        assert_eq!(entry.confirmed_balance, 1_485_000_000);
        assert_eq!(entry.unconfirmed_balance, 0);
    }
}
