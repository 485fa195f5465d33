//! PPLNS reward distribution and the confirmation ledger pass.
//!
//! Each daemon-accepted block pays a fixed reward, minus the pool fee,
//! split over the shares received in a trailing window by share count.
//! Balances are always rebuilt from the reward rows; the confirmation
//! pass flips block status once enough network height has accumulated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time;

use velora_core::{coins_to_atomic, BlockRecord, BlockRewardRecord, BlockStatus};
use velora_storage::{Store, StorageError};
use velora_util::now_ms;

use crate::template::TemplateManager;
use crate::ShutdownRx;

/// Reward and confirmation tuning.
#[derive(Debug, Clone)]
pub struct RewardConfig {
    /// Fixed per-block reward in atomic units
    pub block_reward_atomic: u64,

    /// Pool fee fraction, `0.0..1.0`
    pub fee: f64,

    /// PPLNS window, seconds
    pub pplns_window_secs: u64,

    /// Confirmations before rewards become spendable
    pub confirmations: u64,

    /// Ledger pass interval, seconds
    pub confirm_interval_secs: u64,

    /// Persisted-share retention horizon, seconds
    pub share_retention_secs: u64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        RewardConfig {
            block_reward_atomic: coins_to_atomic(50.0),
            fee: 0.01,
            pplns_window_secs: 600,
            confirmations: 10,
            confirm_interval_secs: 120,
            share_retention_secs: 3_600,
        }
    }
}

/// Splits block rewards over recent shares and confirms the ledger.
pub struct RewardSplitter {
    store: Arc<dyn Store>,
    config: RewardConfig,
}

impl RewardSplitter {
    pub fn new(store: Arc<dyn Store>, config: RewardConfig) -> Self {
        RewardSplitter { store, config }
    }

    /// Allocates one accepted block's reward over the PPLNS window.
    ///
    /// Contributions are counted per address over valid shares; each
    /// contributor gets `net * min(count/total, 1)` in atomic units, with
    /// one reward row persisted per address.
    pub async fn distribute(&self, block: &BlockRecord) -> Result<(), StorageError> {
        let window_start = block
            .created_at
            .saturating_sub(self.config.pplns_window_secs * 1000);
        let shares = self.store.shares_since(window_start).await?;

        let mut counts: HashMap<String, u64> = HashMap::new();
        for share in shares.iter().filter(|s| s.is_valid) {
            *counts.entry(share.address.clone()).or_default() += 1;
        }

        let total: u64 = counts.values().sum();
        if total == 0 {
            warn!(
                "Block at height {} has no shares in the reward window",
                block.height
            );
            return Ok(());
        }

        let base = self.config.block_reward_atomic;
        let pool_fee = (base as f64 * self.config.fee).round() as u64;
        let net = base.saturating_sub(pool_fee);
        let now = now_ms();

        let rewards: Vec<BlockRewardRecord> = counts
            .into_iter()
            .map(|(address, count)| {
                let percentage = (count as f64 / total as f64).min(1.0);
                let miner_reward = (net as f64 * percentage).round() as u64;

                BlockRewardRecord {
                    block_height: block.height,
                    block_hash: block.hash.clone(),
                    miner_address: address,
                    base_reward: base,
                    pool_fee,
                    miner_reward,
                    miner_percentage: percentage,
                    timestamp: now,
                }
            })
            .collect();

        info!(
            "Distributing {} atomic units over {} contributor(s) for height {}",
            net,
            rewards.len(),
            block.height
        );

        self.store.insert_rewards(rewards).await?;
        self.store.recompute_balances().await?;

        Ok(())
    }

    /// One confirmation sweep at the given network height.
    ///
    /// Any found block buried by at least the configured confirmation
    /// count flips to confirmed, then every balance is rebuilt from the
    /// reward rows. Returns how many blocks were confirmed.
    pub async fn confirm_pass(&self, network_height: u64) -> Result<usize, StorageError> {
        let mut confirmed = 0;

        for block in self.store.blocks_by_status(BlockStatus::Found).await? {
            if network_height >= block.height + self.config.confirmations {
                info!(
                    "Block at height {} confirmed ({} confirmations)",
                    block.height,
                    network_height - block.height
                );
                self.store
                    .set_block_status(block.height, BlockStatus::Confirmed)
                    .await?;
                confirmed += 1;
            }
        }

        self.store.recompute_balances().await?;
        Ok(confirmed)
    }

    /// Periodic ledger loop: confirmation pass plus share retention.
    pub async fn run(
        self: Arc<Self>,
        templates: Arc<TemplateManager>,
        mut shutdown: ShutdownRx,
    ) {
        let mut ticker = time::interval(Duration::from_secs(self.config.confirm_interval_secs));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let network_height = templates.latest_index();
                    if let Err(e) = self.confirm_pass(network_height).await {
                        warn!("Confirmation pass failed: {}", e);
                    }

                    let cutoff = now_ms()
                        .saturating_sub(self.config.share_retention_secs * 1000);
                    match self.store.prune_shares_before(cutoff).await {
                        Ok(pruned) if pruned > 0 => {
                            debug!("Pruned {} aged share rows", pruned)
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Share pruning failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Reward ledger loop stopping");
                    break;
                }
            }
        }
    }
}
