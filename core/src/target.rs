//! 256-bit target arithmetic for share and block validation.
//!
//! A difficulty `d` maps to the target `2^256 / d`; a hash counts as meeting
//! the difficulty when its big-endian integer value is less than or equal to
//! that target. Comparisons are inclusive: a hash exactly equal to the
//! target is accepted.

use uint::construct_uint;

use crate::CoreError;

construct_uint! {
    /// 256-bit unsigned integer used for hash and target values.
    pub struct U256(4);
}

/// Computes the target for a given difficulty: `2^256 / difficulty`.
///
/// Difficulty zero is treated as one so the target is always defined.
pub fn target_for_difficulty(difficulty: u64) -> U256 {
    let d = difficulty.max(1);
    U256::MAX / U256::from(d)
}

/// Parses a 64-character hex string into a big-endian 256-bit integer.
pub fn parse_hash(hash_hex: &str) -> Result<U256, CoreError> {
    if hash_hex.len() != 64 {
        return Err(CoreError::InvalidHash(format!(
            "expected 64 hex characters, got {}",
            hash_hex.len()
        )));
    }

    let bytes = hex::decode(hash_hex)
        .map_err(|e| CoreError::InvalidHash(format!("not valid hex: {}", e)))?;

    Ok(U256::from_big_endian(&bytes))
}

/// Checks whether a hash value satisfies `hash <= 2^256 / difficulty`.
pub fn meets_difficulty(hash: &U256, difficulty: u64) -> bool {
    *hash <= target_for_difficulty(difficulty)
}

/// Renders a 256-bit value as a 64-character lowercase hex string.
pub fn to_hash_hex(value: &U256) -> String {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    hex::encode(bytes)
}
