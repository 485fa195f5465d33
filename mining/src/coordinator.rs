//! Block submission: per-height serialization, daemon hand-off, and
//! recovery.
//!
//! Exactly one daemon submission may be outstanding per template height.
//! The height flag is taken before the POST and dropped on every exit
//! path; no other lock is held across the daemon call.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use velora_core::{BlockRecord, BlockStatus, ALGORITHM};
use velora_crypto::HashEngine;
use velora_daemon::{BlockSubmission, DaemonClient};
use velora_storage::Store;
use velora_util::now_ms;

use crate::job::JobManager;
use crate::rewards::RewardSplitter;
use crate::template::TemplateManager;
use crate::validator::BlockSolution;
use crate::{ShutdownRx, SubmitHashMode};

/// Heights with a daemon submission currently in flight.
///
/// Entry is atomic test-and-set; shared between the validator (duplicate
/// suppression) and the coordinator (serialization).
#[derive(Debug, Clone, Default)]
pub struct ProcessingHeights {
    inner: Arc<Mutex<HashSet<u64>>>,
}

impl ProcessingHeights {
    pub fn new() -> Self {
        ProcessingHeights::default()
    }

    /// Whether a submission for the height is in flight.
    pub fn contains(&self, height: u64) -> bool {
        self.inner.lock().unwrap().contains(&height)
    }

    /// Claims the height; `false` when already claimed.
    pub fn try_begin(&self, height: u64) -> bool {
        self.inner.lock().unwrap().insert(height)
    }

    /// Releases the height.
    pub fn finish(&self, height: u64) {
        self.inner.lock().unwrap().remove(&height);
    }
}

/// Releases the height flag when dropped, whatever path exits the
/// submission flow.
struct HeightGuard {
    heights: ProcessingHeights,
    height: u64,
}

impl Drop for HeightGuard {
    fn drop(&mut self) {
        self.heights.finish(self.height);
    }
}

pub struct BlockCoordinator {
    daemon: Arc<DaemonClient>,
    templates: Arc<TemplateManager>,
    jobs: Arc<JobManager>,
    store: Arc<dyn Store>,
    rewards: Arc<RewardSplitter>,
    engine: Arc<dyn HashEngine>,
    processing: ProcessingHeights,
    submit_hash_mode: SubmitHashMode,
}

impl BlockCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        daemon: Arc<DaemonClient>,
        templates: Arc<TemplateManager>,
        jobs: Arc<JobManager>,
        store: Arc<dyn Store>,
        rewards: Arc<RewardSplitter>,
        engine: Arc<dyn HashEngine>,
        processing: ProcessingHeights,
        submit_hash_mode: SubmitHashMode,
    ) -> Self {
        BlockCoordinator {
            daemon,
            templates,
            jobs,
            store,
            rewards,
            engine,
            processing,
            submit_hash_mode,
        }
    }

    /// Consumes block solutions until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut solutions: mpsc::Receiver<BlockSolution>,
        mut shutdown: ShutdownRx,
    ) {
        loop {
            tokio::select! {
                solution = solutions.recv() => {
                    match solution {
                        Some(solution) => self.handle_solution(solution).await,
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    debug!("Block coordinator stopping");
                    break;
                }
            }
        }
    }

    /// Carries one claimed solution through the daemon and recovers from
    /// the outcome. Miners always get fresh work afterwards, accepted or
    /// not.
    pub async fn handle_solution(&self, solution: BlockSolution) {
        let height = solution.job.template.index;

        if !self.processing.try_begin(height) {
            debug!("Submission for height {} already in flight, aborting", height);
            return;
        }
        let _guard = HeightGuard {
            heights: self.processing.clone(),
            height,
        };

        let (submission, record) = self.build_submission(&solution);

        match self.daemon.submit_block(&submission).await {
            Ok(()) => {
                info!(
                    "Daemon accepted block at height {} (hash {})",
                    height, submission.hash
                );

                if let Err(e) = self.store.insert_block(record.clone()).await {
                    error!("Failed to persist block at height {}: {}", height, e);
                }

                if let Err(e) = self.rewards.distribute(&record).await {
                    error!("Reward distribution for height {} failed: {}", height, e);
                }

                self.jobs.invalidate_height(height);
            }
            Err(e) if e.is_rejection() => {
                // A definitive no from the daemon; never retried.
                warn!("Daemon rejected block at height {}: {}", height, e);
            }
            Err(e) => {
                warn!("Block submission transport failure at height {}: {}", height, e);
            }
        }

        // Regardless of outcome, refresh the template and push clean work
        // so miners resume immediately.
        self.templates.force_update().await;
        self.jobs.rebuild(true);
    }

    /// Builds the daemon payload and the matching store row.
    ///
    /// The verification hash is derived from the template's canonical
    /// timestamp and difficulty, not the miner's locally used values; in
    /// `Forward` mode the miner hash passes through unchanged.
    fn build_submission(&self, solution: &BlockSolution) -> (BlockSubmission, BlockRecord) {
        let template = &solution.job.template;
        let nonce = solution.share.nonce_value().unwrap_or(0);

        let hash = match self.submit_hash_mode {
            SubmitHashMode::Recompute => {
                let derived = self.engine.digest_hex(
                    template.index,
                    nonce,
                    template.timestamp,
                    &template.previous_hash,
                    &template.merkle_root,
                    template.difficulty,
                );
                if derived != solution.hash_hex {
                    debug!(
                        "Recomputed submission hash differs from miner hash at height {} ({} != {})",
                        template.index, derived, solution.hash_hex
                    );
                }
                derived
            }
            SubmitHashMode::Forward => solution.hash_hex.clone(),
        };

        let submission = BlockSubmission {
            index: template.index,
            hash: hash.clone(),
            previous_hash: template.previous_hash.clone(),
            merkle_root: template.merkle_root.clone(),
            timestamp: template.timestamp,
            nonce,
            difficulty: template.difficulty,
            transactions: template.transactions.clone(),
            algorithm: ALGORITHM.to_string(),
        };

        let record = BlockRecord {
            height: template.index,
            hash,
            previous_hash: template.previous_hash.clone(),
            merkle_root: template.merkle_root.clone(),
            timestamp: template.timestamp,
            nonce,
            difficulty: template.difficulty,
            found_by: solution.miner_key.clone(),
            status: BlockStatus::Found,
            created_at: now_ms(),
        };

        (submission, record)
    }
}
