//! Block template snapshot pulled from the upstream daemon.
//!
//! A template is an immutable view of the next block to mine. Validation
//! happens once at ingest; every job handed to miners references exactly one
//! validated template.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CoreError;

/// Global floor for the per-miner pool difficulty.
///
/// Keeps the share target far enough below the network target that a share
/// is not, with high probability, also a block.
pub const MIN_POOL_DIFFICULTY: u64 = 1000;

/// Immutable snapshot of the daemon's current block template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Block height
    pub index: u64,

    /// Hash of the previous block (64 hex chars)
    pub previous_hash: String,

    /// Merkle root over the template transactions (64 hex chars)
    pub merkle_root: String,

    /// Template timestamp in milliseconds since epoch
    pub timestamp: u64,

    /// Network difficulty
    pub difficulty: u64,

    /// Opaque transaction list; the first entry is the coinbase
    pub transactions: Vec<Value>,

    /// Per-miner share difficulty derived at ingest
    pub pool_difficulty: u64,

    /// Time past which jobs built from this template are stale (ms)
    pub expires_at: u64,
}

impl Template {
    /// Validates a raw daemon template object and derives the pool
    /// difficulty and expiry.
    ///
    /// Rejects templates with missing fields, an empty transaction list, or
    /// no coinbase transaction.
    pub fn from_daemon(
        raw: &Value,
        starting_difficulty: u64,
        share_timeout_ms: u64,
    ) -> Result<Self, CoreError> {
        let index = required_u64(raw, "index")?;
        let previous_hash = required_hash(raw, "previousHash")?;
        let merkle_root = required_hash(raw, "merkleRoot")?;
        let timestamp = required_u64(raw, "timestamp")?;
        let difficulty = required_u64(raw, "difficulty")?;

        if difficulty == 0 {
            return Err(CoreError::InvalidTemplate(
                "difficulty must be positive".to_string(),
            ));
        }

        let transactions = raw
            .get("transactions")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| CoreError::InvalidTemplate("missing transactions".to_string()))?;

        if transactions.is_empty() {
            return Err(CoreError::InvalidTemplate(
                "transaction list is empty".to_string(),
            ));
        }

        let has_coinbase = transactions
            .iter()
            .any(|tx| tx.get("isCoinbase").and_then(Value::as_bool) == Some(true));
        if !has_coinbase {
            return Err(CoreError::InvalidTemplate(
                "no coinbase transaction".to_string(),
            ));
        }

        Ok(Template {
            index,
            previous_hash,
            merkle_root,
            timestamp,
            difficulty,
            transactions,
            pool_difficulty: derive_pool_difficulty(difficulty, starting_difficulty),
            expires_at: timestamp.saturating_add(share_timeout_ms),
        })
    }

    /// Whether jobs built from this template should no longer be served.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at
    }
}

/// Derives the per-miner share difficulty from the network difficulty.
///
/// `max(starting, 0.2 * network)` clamped to at most `0.5 * network` and
/// never below [`MIN_POOL_DIFFICULTY`].
pub fn derive_pool_difficulty(network_difficulty: u64, starting_difficulty: u64) -> u64 {
    let fifth = network_difficulty / 5;
    let half = network_difficulty / 2;

    starting_difficulty
        .max(fifth)
        .min(half)
        .max(MIN_POOL_DIFFICULTY)
}

fn required_u64(raw: &Value, field: &str) -> Result<u64, CoreError> {
    raw.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::InvalidTemplate(format!("missing or invalid field: {}", field)))
}

fn required_hash(raw: &Value, field: &str) -> Result<String, CoreError> {
    let value = raw
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::InvalidTemplate(format!("missing or invalid field: {}", field)))?;

    if !velora_util::is_hex_of_len(value, 64) {
        return Err(CoreError::InvalidTemplate(format!(
            "field {} is not a 64-char hex hash",
            field
        )));
    }

    Ok(value.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_template() -> Value {
        json!({
            "index": 42,
            "previousHash": "ab".repeat(32),
            "merkleRoot": "cd".repeat(32),
            "timestamp": 1_700_000_000_000u64,
            "difficulty": 1_000_000,
            "transactions": [
                {"isCoinbase": true, "outputs": []},
                {"isCoinbase": false, "outputs": []}
            ]
        })
    }

    #[test]
    fn test_valid_template_ingest() {
        let template = Template::from_daemon(&raw_template(), 100, 300_000).unwrap();
        assert_eq!(template.index, 42);
        assert_eq!(template.expires_at, 1_700_000_000_000 + 300_000);
        assert_eq!(template.transactions.len(), 2);
    }

    #[test]
    fn test_missing_field_rejected() {
        let mut raw = raw_template();
        raw.as_object_mut().unwrap().remove("merkleRoot");
        assert!(Template::from_daemon(&raw, 100, 300_000).is_err());
    }

    #[test]
    fn test_empty_transactions_rejected() {
        let mut raw = raw_template();
        raw["transactions"] = json!([]);
        assert!(Template::from_daemon(&raw, 100, 300_000).is_err());
    }

    #[test]
    fn test_missing_coinbase_rejected() {
        let mut raw = raw_template();
        raw["transactions"] = json!([{"isCoinbase": false}]);
        assert!(Template::from_daemon(&raw, 100, 300_000).is_err());
    }

    #[test]
    fn test_short_hash_rejected() {
        let mut raw = raw_template();
        raw["previousHash"] = json!("abcd");
        assert!(Template::from_daemon(&raw, 100, 300_000).is_err());
    }

    #[test]
    fn test_pool_difficulty_floor() {
        // Network 1000 with starting 100: 0.2 * 1000 = 200, clamped up to the
        // global floor of 1000.
        assert_eq!(derive_pool_difficulty(1000, 100), MIN_POOL_DIFFICULTY);
    }

    #[test]
    fn test_pool_difficulty_tracks_network() {
        // 0.2 * 1_000_000 = 200_000 dominates a small starting difficulty.
        assert_eq!(derive_pool_difficulty(1_000_000, 100), 200_000);
    }

    #[test]
    fn test_pool_difficulty_upper_clamp() {
        // A huge starting difficulty is capped at half the network difficulty.
        assert_eq!(derive_pool_difficulty(1_000_000, 900_000), 500_000);
    }

    #[test]
    fn test_expiry() {
        let template = Template::from_daemon(&raw_template(), 100, 300_000).unwrap();
        assert!(!template.is_expired(template.expires_at));
        assert!(template.is_expired(template.expires_at + 1));
    }
}
