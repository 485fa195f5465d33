//! Per-miner difficulty control.
//!
//! Keeps each miner's share-arrival interval near a fixed target so load
//! stays predictable and share records stay bounded. Adjustments are
//! throttled, multiplicative, and committed only when they matter.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use log::debug;

use crate::ClientId;

/// Controller tuning.
///
/// The defaults are the conservative variant: 6 s target interval, 1.2x
/// raise cap, 60 s between adjustments.
#[derive(Debug, Clone)]
pub struct DifficultyConfig {
    /// Target seconds between shares per miner
    pub target_interval_secs: f64,

    /// Sliding window over recent shares, seconds
    pub window_secs: u64,

    /// Minimum seconds between committed adjustments
    pub retarget_cooldown_secs: u64,

    /// Minimum shares in the window before adjusting
    pub min_window_shares: usize,

    /// Minimum valid shares in the window before adjusting
    pub min_valid_shares: usize,

    /// Multiplier applied when shares arrive too fast
    pub raise_factor: f64,

    /// Multiplier applied when shares arrive too slowly
    pub lower_factor: f64,

    /// Minimum relative change worth pushing to the miner
    pub commit_threshold: f64,

    /// Difficulty clamp bounds
    pub min_difficulty: u64,
    pub max_difficulty: u64,
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        DifficultyConfig {
            target_interval_secs: 6.0,
            window_secs: 120,
            retarget_cooldown_secs: 60,
            min_window_shares: 5,
            min_valid_shares: 3,
            raise_factor: 1.2,
            lower_factor: 0.8,
            commit_threshold: 0.10,
            min_difficulty: 1000,
            max_difficulty: i64::MAX as u64,
        }
    }
}

/// Ring of recent shares for one miner.
#[derive(Debug)]
struct MinerShareWindow {
    difficulty: u64,
    shares: VecDeque<(u64, bool)>,
    last_adjustment_ms: u64,
}

/// Per-miner difficulty controller.
pub struct DifficultyController {
    config: DifficultyConfig,
    miners: Mutex<HashMap<ClientId, MinerShareWindow>>,
}

impl DifficultyController {
    pub fn new(config: DifficultyConfig) -> Self {
        DifficultyController {
            config,
            miners: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a miner at the given starting difficulty.
    ///
    /// The registration time seeds the adjustment throttle, so the first
    /// retarget can happen no earlier than one cooldown later.
    pub fn register(&self, client_id: ClientId, starting_difficulty: u64, now_ms: u64) -> u64 {
        let difficulty = starting_difficulty.max(1);
        self.miners.lock().unwrap().insert(
            client_id,
            MinerShareWindow {
                difficulty,
                shares: VecDeque::new(),
                last_adjustment_ms: now_ms,
            },
        );
        difficulty
    }

    /// Forgets a disconnected miner.
    pub fn remove(&self, client_id: ClientId) {
        self.miners.lock().unwrap().remove(&client_id);
    }

    /// The miner's active difficulty.
    pub fn current(&self, client_id: ClientId) -> Option<u64> {
        self.miners
            .lock()
            .unwrap()
            .get(&client_id)
            .map(|m| m.difficulty)
    }

    /// Applies a miner-suggested difficulty, clamped to `[1, 1_000_000]`.
    pub fn suggest(&self, client_id: ClientId, requested: u64, now_ms: u64) -> Option<u64> {
        let clamped = requested.clamp(1, 1_000_000);
        let mut miners = self.miners.lock().unwrap();
        let miner = miners.get_mut(&client_id)?;

        miner.difficulty = clamped;
        miner.last_adjustment_ms = now_ms;
        Some(clamped)
    }

    /// Records a share and evaluates the retarget rule.
    ///
    /// Returns the new difficulty when an adjustment was committed; the
    /// caller pushes `mining.set_difficulty` to the client.
    pub fn record_share(&self, client_id: ClientId, valid: bool, now_ms: u64) -> Option<u64> {
        let mut miners = self.miners.lock().unwrap();
        let miner = miners.get_mut(&client_id)?;

        miner.shares.push_back((now_ms, valid));

        let window_start = now_ms.saturating_sub(self.config.window_secs * 1000);
        while matches!(miner.shares.front(), Some((ts, _)) if *ts < window_start) {
            miner.shares.pop_front();
        }

        self.evaluate(miner, now_ms).map(|new_difficulty| {
            debug!(
                "Difficulty adjusted for client {}: {} -> {}",
                client_id, miner.difficulty, new_difficulty
            );
            miner.difficulty = new_difficulty;
            miner.last_adjustment_ms = now_ms;
            new_difficulty
        })
    }

    fn evaluate(&self, miner: &MinerShareWindow, now_ms: u64) -> Option<u64> {
        let cfg = &self.config;

        if now_ms.saturating_sub(miner.last_adjustment_ms) < cfg.retarget_cooldown_secs * 1000 {
            return None;
        }

        if miner.shares.len() < cfg.min_window_shares {
            return None;
        }

        let valid: Vec<u64> = miner
            .shares
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(ts, _)| *ts)
            .collect();
        if valid.len() < cfg.min_valid_shares {
            return None;
        }

        let oldest = valid[0];
        let observed_interval =
            (now_ms.saturating_sub(oldest) as f64 / 1000.0) / (valid.len() - 1) as f64;

        let factor = if observed_interval < 0.7 * cfg.target_interval_secs {
            cfg.raise_factor
        } else if observed_interval > 1.5 * cfg.target_interval_secs {
            cfg.lower_factor
        } else {
            return None;
        };

        let candidate = ((miner.difficulty as f64 * factor).round() as u64)
            .clamp(cfg.min_difficulty, cfg.max_difficulty);

        let relative_change =
            (candidate as f64 - miner.difficulty as f64).abs() / miner.difficulty as f64;
        if relative_change < cfg.commit_threshold {
            return None;
        }

        Some(candidate)
    }
}
