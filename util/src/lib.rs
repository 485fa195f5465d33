//! Utility functions and types shared across the Velora pool workspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("Hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("Base58 decoding error: {0}")]
    Base58Error(#[from] bs58::decode::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Converts a hex string to bytes
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, UtilError> {
    Ok(hex::decode(hex)?)
}

/// Converts bytes to a hex string
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Converts a base58 string to bytes
pub fn base58_to_bytes(b58: &str) -> Result<Vec<u8>, UtilError> {
    Ok(bs58::decode(b58).into_vec()?)
}

/// Converts bytes to a base58 string
pub fn bytes_to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// All share, job, and template timestamps in the pool use this resolution.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp() as u64
}

/// Formats a millisecond timestamp as an ISO 8601 string
pub fn format_timestamp_ms(timestamp_ms: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(timestamp_ms as i64)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| "Invalid timestamp".to_string())
}

/// Checks that a string is exactly `len` hex characters.
pub fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0xde, 0xad, 0xbe, 0xef];
        let encoded = bytes_to_hex(&bytes);
        assert_eq!(encoded, "deadbeef");
        assert_eq!(hex_to_bytes(&encoded).unwrap(), bytes);
    }

    #[test]
    fn test_hex_of_len() {
        assert!(is_hex_of_len("a1b2c3d4", 8));
        assert!(is_hex_of_len("A1B2C3D4", 8));
        assert!(!is_hex_of_len("a1b2c3d", 8));
        assert!(!is_hex_of_len("a1b2c3dg", 8));
    }

    #[test]
    fn test_format_timestamp() {
        let formatted = format_timestamp_ms(0);
        assert_eq!(formatted, "1970-01-01T00:00:00.000Z");
    }
}
