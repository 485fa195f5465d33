//! Share submissions and their structural validation.

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// A canonicalized share submission.
///
/// The Stratum dispatch layer folds both the array and object parameter
/// forms into this record before validation; `hash` may be absent for the
/// classic array form, in which case the validator derives it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    /// Job the share was mined against
    pub job_id: String,

    /// Nonce as submitted (8 hex chars)
    pub nonce: String,

    /// Block timestamp used by the miner, hex seconds
    pub ntime: String,

    /// Share hash (64 hex chars), when the miner supplied one
    pub hash: Option<String>,

    /// Extra nonce from the classic submit form, passed through to storage
    pub extra_nonce2: Option<String>,

    /// Worker name as submitted
    pub worker: String,

    /// Pool difficulty active for the client at receive time
    pub difficulty: u64,

    /// Receive time (ms since epoch)
    pub timestamp: u64,
}

impl Share {
    /// Checks field shapes: 8-hex nonce, 64-hex hash when present, parseable
    /// hex ntime, positive difficulty.
    pub fn validate_structure(&self) -> Result<(), CoreError> {
        if self.job_id.is_empty() {
            return Err(CoreError::InvalidShare("missing job id".to_string()));
        }

        if !velora_util::is_hex_of_len(&self.nonce, 8) {
            return Err(CoreError::InvalidShare(format!(
                "nonce must be 8 hex characters, got {:?}",
                self.nonce
            )));
        }

        if let Some(hash) = &self.hash {
            if !velora_util::is_hex_of_len(hash, 64) {
                return Err(CoreError::InvalidShare(
                    "hash must be 64 hex characters".to_string(),
                ));
            }
        }

        if self.ntime_secs().is_none() {
            return Err(CoreError::InvalidShare(format!(
                "ntime is not hex seconds: {:?}",
                self.ntime
            )));
        }

        if self.difficulty == 0 {
            return Err(CoreError::InvalidShare(
                "difficulty must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// The miner's block timestamp in seconds, when parseable.
    pub fn ntime_secs(&self) -> Option<u64> {
        u64::from_str_radix(&self.ntime, 16).ok()
    }

    /// The nonce as an integer.
    pub fn nonce_value(&self) -> Option<u64> {
        u64::from_str_radix(&self.nonce, 16).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share() -> Share {
        Share {
            job_id: "0000000000000001".to_string(),
            nonce: "deadbeef".to_string(),
            ntime: "65a0cf00".to_string(),
            hash: Some("0".repeat(64)),
            extra_nonce2: None,
            worker: "1PoolAddrxxxxxxxxxxxxxxxxxx.rig1".to_string(),
            difficulty: 1000,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_valid_share_structure() {
        assert!(share().validate_structure().is_ok());
    }

    #[test]
    fn test_nonce_length_rejected() {
        let mut s = share();
        s.nonce = "deadbee".to_string();
        assert!(s.validate_structure().is_err());

        s.nonce = "deadbeef0".to_string();
        assert!(s.validate_structure().is_err());
    }

    #[test]
    fn test_hash_length_rejected() {
        let mut s = share();
        s.hash = Some("0".repeat(63));
        assert!(s.validate_structure().is_err());
    }

    #[test]
    fn test_missing_hash_is_structurally_fine() {
        let mut s = share();
        s.hash = None;
        assert!(s.validate_structure().is_ok());
    }

    #[test]
    fn test_bad_ntime_rejected() {
        let mut s = share();
        s.ntime = "not-hex".to_string();
        assert!(s.validate_structure().is_err());
    }

    #[test]
    fn test_zero_difficulty_rejected() {
        let mut s = share();
        s.difficulty = 0;
        assert!(s.validate_structure().is_err());
    }

    #[test]
    fn test_ntime_parse() {
        assert_eq!(share().ntime_secs(), Some(0x65a0cf00));
        assert_eq!(share().nonce_value(), Some(0xdeadbeef));
    }
}
