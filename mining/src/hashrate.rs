//! Hashrate estimation from timestamped share records.
//!
//! Estimates are display values, not consensus: the raw figure scales
//! share difficulty per second by an algorithm calibration constant, and
//! a time-weighted EMA smooths it so single lucky shares cannot spike the
//! reading.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::ClientId;

/// Estimator tuning.
#[derive(Debug, Clone)]
pub struct HashrateConfig {
    /// Sample window, seconds
    pub window_secs: u64,

    /// Hard cap on retained samples per miner
    pub max_samples: usize,

    /// Minimum in-window samples before an estimate is produced
    pub min_samples: usize,

    /// Calibration constant: hashes per second per difficulty unit
    pub scale: f64,

    /// Effective smoothing horizon for the EMA, seconds
    pub ema_horizon_secs: f64,

    /// Per-update relative change cap
    pub max_step: f64,
}

impl Default for HashrateConfig {
    fn default() -> Self {
        HashrateConfig {
            window_secs: 180,
            max_samples: 100,
            min_samples: 2,
            scale: 0.24,
            ema_horizon_secs: 90.0,
            max_step: 0.10,
        }
    }
}

#[derive(Debug, Default)]
struct MinerRate {
    /// Recent accepted shares as `(timestamp_ms, difficulty)`
    samples: VecDeque<(u64, u64)>,
    /// Smoothed estimate, hashes per second
    smoothed: f64,
    /// Last smoothing update
    last_update_ms: u64,
    /// Lifetime accepted share count
    total_shares: u64,
}

/// Per-miner and pool-wide hashrate estimator.
pub struct HashrateEstimator {
    config: HashrateConfig,
    miners: Mutex<HashMap<ClientId, MinerRate>>,
}

impl HashrateEstimator {
    pub fn new(config: HashrateConfig) -> Self {
        HashrateEstimator {
            config,
            miners: Mutex::new(HashMap::new()),
        }
    }

    /// Tracks a miner; estimates read 0 until enough shares arrive.
    pub fn register(&self, client_id: ClientId) {
        self.miners
            .lock()
            .unwrap()
            .entry(client_id)
            .or_default();
    }

    /// Forgets a disconnected miner.
    pub fn remove(&self, client_id: ClientId) {
        self.miners.lock().unwrap().remove(&client_id);
    }

    /// Records an accepted share and refreshes the smoothed estimate.
    pub fn record_share(&self, client_id: ClientId, difficulty: u64, now_ms: u64) {
        let cfg = &self.config;
        let mut miners = self.miners.lock().unwrap();
        let miner = miners.entry(client_id).or_default();

        miner.total_shares += 1;
        miner.samples.push_back((now_ms, difficulty));

        let window_start = now_ms.saturating_sub(cfg.window_secs * 1000);
        while matches!(miner.samples.front(), Some((ts, _)) if *ts < window_start) {
            miner.samples.pop_front();
        }
        while miner.samples.len() > cfg.max_samples {
            miner.samples.pop_front();
        }

        let raw = raw_estimate(&miner.samples, cfg);

        if miner.last_update_ms == 0 || miner.smoothed == 0.0 {
            miner.smoothed = raw;
        } else {
            let dt = now_ms.saturating_sub(miner.last_update_ms) as f64 / 1000.0;
            let alpha = 1.0 - (-dt / cfg.ema_horizon_secs).exp();
            let mut next = miner.smoothed + alpha * (raw - miner.smoothed);

            // Per-update change cap.
            let max_delta = miner.smoothed * cfg.max_step;
            next = next.clamp(miner.smoothed - max_delta, miner.smoothed + max_delta);
            miner.smoothed = next;
        }
        miner.last_update_ms = now_ms;
    }

    /// The miner's smoothed estimate in hashes per second; 0 with fewer
    /// than two in-window shares.
    pub fn estimate(&self, client_id: ClientId, now_ms: u64) -> f64 {
        let miners = self.miners.lock().unwrap();
        let Some(miner) = miners.get(&client_id) else {
            return 0.0;
        };

        if in_window_count(&miner.samples, now_ms, self.config.window_secs) < self.config.min_samples
        {
            return 0.0;
        }

        miner.smoothed
    }

    /// Pool total: sum of per-miner estimates.
    pub fn pool_total(&self, now_ms: u64) -> f64 {
        let miners = self.miners.lock().unwrap();
        miners
            .values()
            .filter(|m| {
                in_window_count(&m.samples, now_ms, self.config.window_secs)
                    >= self.config.min_samples
            })
            .map(|m| m.smoothed)
            .sum()
    }

    /// Per-miner `(estimate, lifetime shares)` snapshot for persistence.
    pub fn snapshot(&self, now_ms: u64) -> Vec<(ClientId, f64, u64)> {
        let miners = self.miners.lock().unwrap();
        miners
            .iter()
            .map(|(id, m)| {
                let rate = if in_window_count(&m.samples, now_ms, self.config.window_secs)
                    >= self.config.min_samples
                {
                    m.smoothed
                } else {
                    0.0
                };
                (*id, rate, m.total_shares)
            })
            .collect()
    }
}

fn in_window_count(samples: &VecDeque<(u64, u64)>, now_ms: u64, window_secs: u64) -> usize {
    let window_start = now_ms.saturating_sub(window_secs * 1000);
    samples.iter().filter(|(ts, _)| *ts >= window_start).count()
}

fn raw_estimate(samples: &VecDeque<(u64, u64)>, cfg: &HashrateConfig) -> f64 {
    if samples.len() < cfg.min_samples {
        return 0.0;
    }

    let oldest = samples.front().map(|(ts, _)| *ts).unwrap_or(0);
    let newest = samples.back().map(|(ts, _)| *ts).unwrap_or(0);
    let span_secs = (newest.saturating_sub(oldest) as f64 / 1000.0).max(1.0);

    let count = samples.len() as f64;
    let avg_difficulty =
        samples.iter().map(|(_, d)| *d as f64).sum::<f64>() / count;

    count * avg_difficulty * cfg.scale / span_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> HashrateEstimator {
        HashrateEstimator::new(HashrateConfig::default())
    }

    #[test]
    fn test_single_share_reads_zero() {
        let e = estimator();
        e.register(1);
        e.record_share(1, 1000, 10_000);
        assert_eq!(e.estimate(1, 10_000), 0.0);
    }

    #[test]
    fn test_steady_shares_estimate() {
        // 1000-difficulty shares every 6 s for a minute: raw rate is
        // count * avgDiff * k / span = 11 * 1000 * 0.24 / 60 = 44 H/s.
        let e = estimator();
        e.register(1);
        for i in 0..=10 {
            e.record_share(1, 1000, 10_000 + i * 6_000);
        }

        let hps = e.estimate(1, 70_000);
        assert!(hps > 0.0);
        // The EMA cap limits travel from the first raw reading, so check
        // order of magnitude rather than the exact raw figure.
        assert!(hps < 100.0, "estimate {} out of range", hps);
    }

    #[test]
    fn test_update_step_is_capped() {
        let e = estimator();
        e.register(1);
        e.record_share(1, 1000, 0);
        e.record_share(1, 1000, 6_000);
        let first = e.estimate(1, 6_000);
        assert!(first > 0.0);

        // A burst of much harder shares cannot move the estimate more
        // than 10% per update.
        e.record_share(1, 1_000_000, 12_000);
        let second = e.estimate(1, 12_000);
        assert!(second <= first * 1.1 + 1e-9);
    }

    #[test]
    fn test_stale_miner_reads_zero() {
        let e = estimator();
        e.register(1);
        e.record_share(1, 1000, 0);
        e.record_share(1, 1000, 6_000);
        assert!(e.estimate(1, 6_000) > 0.0);

        // Four minutes later every sample has left the window.
        assert_eq!(e.estimate(1, 246_000), 0.0);
    }

    #[test]
    fn test_pool_total_sums_active_miners() {
        let e = estimator();
        for id in [1, 2] {
            e.register(id);
            e.record_share(id, 1000, 0);
            e.record_share(id, 1000, 6_000);
        }
        // Miner 3 has a single share: excluded.
        e.register(3);
        e.record_share(3, 1000, 6_000);

        let total = e.pool_total(6_000);
        let sum = e.estimate(1, 6_000) + e.estimate(2, 6_000);
        assert!((total - sum).abs() < 1e-9);
    }

    #[test]
    fn test_sample_cap() {
        let e = HashrateEstimator::new(HashrateConfig {
            window_secs: 10_000,
            ..Default::default()
        });
        e.register(1);
        for i in 0..500u64 {
            e.record_share(1, 1000, i * 10);
        }

        let miners = e.miners.lock().unwrap();
        assert!(miners[&1].samples.len() <= 100);
        assert_eq!(miners[&1].total_shares, 500);
    }

    #[test]
    fn test_remove_clears_state() {
        let e = estimator();
        e.register(1);
        e.record_share(1, 1000, 0);
        e.remove(1);
        assert_eq!(e.estimate(1, 0), 0.0);
        assert!(e.snapshot(0).is_empty());
    }
}
