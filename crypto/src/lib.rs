//! Velora Hash Engine
//!
//! The pool treats the Velora proof-of-work function as an opaque pure
//! digest over fixed block-header inputs. This crate provides that seam: a
//! [`HashEngine`] trait consumed by the share validator and block
//! coordinator, and a default Keccak-256 based engine.
//!
//! The pool never grinds this function; it is evaluated once per block
//! submission (to re-derive the canonical daemon hash) and once per share
//! that arrives without a precomputed hash.

use sha3::{Digest, Keccak256};

use velora_core::U256;

/// Pure digest over block header fields.
///
/// Implementations must be deterministic: the same inputs always produce
/// the same 256-bit output.
pub trait HashEngine: Send + Sync {
    /// Computes `H(index, nonce, timestamp, prev_hash, merkle_root, difficulty)`.
    fn digest(
        &self,
        index: u64,
        nonce: u64,
        timestamp: u64,
        previous_hash: &str,
        merkle_root: &str,
        difficulty: u64,
    ) -> [u8; 32];

    /// The digest rendered as a 64-character lowercase hex string.
    fn digest_hex(
        &self,
        index: u64,
        nonce: u64,
        timestamp: u64,
        previous_hash: &str,
        merkle_root: &str,
        difficulty: u64,
    ) -> String {
        hex::encode(self.digest(index, nonce, timestamp, previous_hash, merkle_root, difficulty))
    }

    /// The digest as a 256-bit big-endian integer.
    fn digest_value(
        &self,
        index: u64,
        nonce: u64,
        timestamp: u64,
        previous_hash: &str,
        merkle_root: &str,
        difficulty: u64,
    ) -> U256 {
        U256::from_big_endian(&self.digest(
            index,
            nonce,
            timestamp,
            previous_hash,
            merkle_root,
            difficulty,
        ))
    }
}

/// Default Velora engine: Keccak-256 over a length-stable field encoding.
///
/// Field order and widths match the header inputs the daemon hashes; the
/// hex hash fields are folded in as raw bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct VeloraEngine;

impl VeloraEngine {
    pub fn new() -> Self {
        VeloraEngine
    }
}

impl HashEngine for VeloraEngine {
    fn digest(
        &self,
        index: u64,
        nonce: u64,
        timestamp: u64,
        previous_hash: &str,
        merkle_root: &str,
        difficulty: u64,
    ) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update(index.to_be_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(timestamp.to_be_bytes());
        hasher.update(hex::decode(previous_hash).unwrap_or_default());
        hasher.update(hex::decode(merkle_root).unwrap_or_default());
        hasher.update(difficulty.to_be_bytes());

        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREV: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const ROOT: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn test_digest_is_deterministic() {
        let engine = VeloraEngine::new();
        let a = engine.digest(1, 2, 3, PREV, ROOT, 4);
        let b = engine.digest(1, 2, 3, PREV, ROOT, 4);
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_varies_with_each_input() {
        let engine = VeloraEngine::new();
        let base = engine.digest(1, 2, 3, PREV, ROOT, 4);

        assert_ne!(engine.digest(9, 2, 3, PREV, ROOT, 4), base);
        assert_ne!(engine.digest(1, 9, 3, PREV, ROOT, 4), base);
        assert_ne!(engine.digest(1, 2, 9, PREV, ROOT, 4), base);
        assert_ne!(engine.digest(1, 2, 3, ROOT, ROOT, 4), base);
        assert_ne!(engine.digest(1, 2, 3, PREV, PREV, 4), base);
        assert_ne!(engine.digest(1, 2, 3, PREV, ROOT, 9), base);
    }

    #[test]
    fn test_digest_hex_shape() {
        let engine = VeloraEngine::new();
        let hex = engine.digest_hex(1, 2, 3, PREV, ROOT, 4);
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
