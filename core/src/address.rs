//! Pool payout address validation.

use crate::CoreError;

/// Base58 alphabet used by P2PKH addresses (excludes `0`, `O`, `I`, `l`).
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Validates a P2PKH pool payout address.
///
/// Accepts addresses that start with `'1'`, are 26 to 35 characters long,
/// use only the Base58 alphabet, and decode as Base58. An invalid pool
/// address is a fatal startup error for the pool process.
pub fn validate_pool_address(address: &str) -> Result<(), CoreError> {
    if !address.starts_with('1') {
        return Err(CoreError::InvalidAddress(
            "address must start with '1'".to_string(),
        ));
    }

    if address.len() < 26 || address.len() > 35 {
        return Err(CoreError::InvalidAddress(format!(
            "address length {} outside 26-35",
            address.len()
        )));
    }

    if let Some(bad) = address.chars().find(|c| !BASE58_ALPHABET.contains(*c)) {
        return Err(CoreError::InvalidAddress(format!(
            "invalid character {:?} in address",
            bad
        )));
    }

    bs58::decode(address)
        .into_vec()
        .map_err(|e| CoreError::InvalidAddress(format!("not valid base58: {}", e)))?;

    Ok(())
}
