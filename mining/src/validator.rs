//! Share validation, block detection, and fan-out.
//!
//! The validator rejects malformed and stale shares, checks the proof
//! against the client's pool difficulty, and detects block solutions. The
//! submitted hash is accepted at face value for the target comparison;
//! producing a passing hash costs the same work as honest mining, so the
//! pool does not re-execute the proof per share.

use std::sync::Arc;

use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::mpsc;

use velora_core::{meets_difficulty, parse_hash, Job, Share, ShareRecord, U256};
use velora_crypto::HashEngine;
use velora_storage::{miner_key, Store};
use velora_util::now_ms;

use crate::coordinator::ProcessingHeights;
use crate::hashrate::HashrateEstimator;
use crate::job::JobManager;
use crate::{ClientId, PoolCounters};

/// Reply class for an accepted share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// Ordinary share: reply `OK`
    Accepted,
    /// Block solution: reply `WAIT` so the miner pauses for fresh work
    BlockCandidate,
}

/// Share rejection reasons; display strings go to the miner verbatim.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShareError {
    #[error("No block template available")]
    NoTemplate,

    #[error("Job not found")]
    UnknownJob,

    #[error("Job has expired")]
    ExpiredJob,

    #[error("Share is too old")]
    Stale,

    #[error("Invalid share: {0}")]
    Malformed(String),

    #[error("Low difficulty share")]
    LowDifficulty,
}

/// A share that also meets the network target, en route to the
/// BlockCoordinator.
#[derive(Debug)]
pub struct BlockSolution {
    pub job: Arc<Job>,
    pub share: Share,
    /// The hash used for the target comparisons, 64 hex chars
    pub hash_hex: String,
    pub hash_value: U256,
    pub miner_key: String,
    pub address: String,
}

pub struct ShareValidator {
    jobs: Arc<JobManager>,
    engine: Arc<dyn HashEngine>,
    hashrate: Arc<HashrateEstimator>,
    store: Arc<dyn Store>,
    counters: Arc<PoolCounters>,
    processing: ProcessingHeights,
    solutions: mpsc::Sender<BlockSolution>,
    share_timeout_ms: u64,
}

impl ShareValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        jobs: Arc<JobManager>,
        engine: Arc<dyn HashEngine>,
        hashrate: Arc<HashrateEstimator>,
        store: Arc<dyn Store>,
        counters: Arc<PoolCounters>,
        processing: ProcessingHeights,
        solutions: mpsc::Sender<BlockSolution>,
        share_timeout_ms: u64,
    ) -> Self {
        ShareValidator {
            jobs,
            engine,
            hashrate,
            store,
            counters,
            processing,
            solutions,
            share_timeout_ms,
        }
    }

    /// Validates one share from an authorized client.
    ///
    /// The share's `difficulty` field carries the client's pool difficulty
    /// as it was at receive time; a later retarget never invalidates a
    /// share already in flight.
    pub async fn process(
        &self,
        client_id: ClientId,
        address: &str,
        worker: &str,
        share: Share,
    ) -> Result<ShareOutcome, ShareError> {
        if let Err(e) = share.validate_structure() {
            self.counters.inc_invalid();
            return Err(ShareError::Malformed(e.to_string()));
        }

        let job = match self.jobs.get(&share.job_id) {
            Some(job) => job,
            None if self.jobs.current_job().is_none() => {
                return Err(ShareError::NoTemplate);
            }
            None => {
                self.counters.inc_invalid();
                return Err(ShareError::UnknownJob);
            }
        };

        let now = now_ms();
        if job.is_expired(now) {
            self.counters.inc_invalid();
            return Err(ShareError::ExpiredJob);
        }

        // validate_structure guarantees ntime parses.
        let ntime_ms = share.ntime_secs().unwrap_or(0).saturating_mul(1000);
        if now.saturating_sub(ntime_ms) > self.share_timeout_ms {
            self.counters.inc_stale();
            return Err(ShareError::Stale);
        }

        let (hash_hex, hash_value) = self.share_hash(&job, &share)?;

        let key = miner_key(address, worker);

        if !meets_difficulty(&hash_value, share.difficulty) {
            self.counters.inc_invalid();
            self.persist_share(&key, address, worker, &share, false, false);
            return Err(ShareError::LowDifficulty);
        }

        self.counters.inc_valid();
        self.hashrate
            .record_share(client_id, share.difficulty, now);

        let is_block = meets_difficulty(&hash_value, job.template.difficulty);
        self.persist_share(&key, address, worker, &share, true, is_block);

        if !is_block {
            return Ok(ShareOutcome::Accepted);
        }

        self.counters.inc_blocks_found();
        let height = job.template.index;

        if self.processing.contains(height) {
            // A submission for this height is already in flight; the miner
            // still gets WAIT but nothing is resubmitted.
            debug!(
                "Block solution for height {} while submission in flight, dropping duplicate",
                height
            );
            return Ok(ShareOutcome::BlockCandidate);
        }

        info!(
            "Block solution at height {} from {} (hash {})",
            height, key, hash_hex
        );

        let solution = BlockSolution {
            job,
            share,
            hash_hex,
            hash_value,
            miner_key: key,
            address: address.to_string(),
        };
        if let Err(e) = self.solutions.send(solution).await {
            error!("Block coordinator channel closed: {}", e);
        }

        Ok(ShareOutcome::BlockCandidate)
    }

    /// The hash used for target comparisons: the miner's when supplied,
    /// otherwise derived through the engine from the submitted fields.
    fn share_hash(&self, job: &Job, share: &Share) -> Result<(String, U256), ShareError> {
        let hash_hex = match &share.hash {
            Some(hash) => hash.to_lowercase(),
            None => {
                let template = &job.template;
                self.engine.digest_hex(
                    template.index,
                    share.nonce_value().unwrap_or(0),
                    share.ntime_secs().unwrap_or(0).saturating_mul(1000),
                    &template.previous_hash,
                    &template.merkle_root,
                    template.difficulty,
                )
            }
        };

        let hash_value = parse_hash(&hash_hex).map_err(|_| {
            self.counters.inc_invalid();
            ShareError::Malformed("Invalid hash".to_string())
        })?;

        Ok((hash_hex, hash_value))
    }

    /// Persists the share row without blocking the submit path; store
    /// failures are logged and accounting continues in memory.
    fn persist_share(
        &self,
        key: &str,
        address: &str,
        worker: &str,
        share: &Share,
        is_valid: bool,
        is_block: bool,
    ) {
        let record = ShareRecord {
            miner_key: key.to_string(),
            address: address.to_string(),
            worker: worker.to_string(),
            job_id: share.job_id.clone(),
            extra_nonce2: share.extra_nonce2.clone(),
            ntime: share.ntime.clone(),
            nonce: share.nonce.clone(),
            difficulty: share.difficulty,
            is_valid,
            is_block,
            timestamp: share.timestamp,
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.record_share(record).await {
                error!("Failed to persist share: {}", e);
            }
        });
    }
}
