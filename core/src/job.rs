//! Miner-facing work units.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::template::Template;
use crate::ALGORITHM;

/// A unit of work handed to miners.
///
/// Each job wraps exactly one template snapshot. Job ids are opaque to
/// miners and strictly monotonic for the lifetime of the server.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job id
    pub id: String,

    /// The template snapshot this job was built from
    pub template: Arc<Template>,

    /// Creation time (ms since epoch)
    pub created_at: u64,

    /// Time past which submissions against this job are rejected (ms)
    pub expires_at: u64,

    /// When set, miners must abandon all earlier jobs
    pub clean_jobs: bool,
}

impl Job {
    /// Builds a job over a template.
    pub fn new(id: String, template: Arc<Template>, created_at: u64, clean_jobs: bool) -> Self {
        let expires_at = template.expires_at;
        Job {
            id,
            template,
            created_at,
            expires_at,
            clean_jobs,
        }
    }

    /// Whether the job should no longer be served or accept shares.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }

    /// Renders the wire payload sent to one miner.
    ///
    /// The payload shape is shared by the `login` reply and the `job` /
    /// `mining.notify` notifications; `pool_difficulty` is the receiving
    /// client's share difficulty, not the template-derived default. The
    /// timestamp is the job's creation time, so periodic regeneration at
    /// an unchanged height still advances the ntime miners work with.
    pub fn notification(&self, pool_difficulty: u64) -> Value {
        json!({
            "job_id": self.id,
            "height": self.template.index,
            "timestamp": self.created_at,
            "previous_hash": self.template.previous_hash,
            "merkle_root": self.template.merkle_root,
            "difficulty": self.template.difficulty,
            "pool_difficulty": pool_difficulty,
            "algo": ALGORITHM,
        })
    }
}
