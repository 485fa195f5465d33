//! Stratum Server for the Velora Mining Pool
//!
//! Long-lived TCP endpoint speaking newline-delimited JSON-RPC with
//! miners: subscription, authorization, share submission, difficulty
//! pushes, and job notifications. The server dispatches into the
//! `velora-mining` components and never lets one miner's errors disturb
//! another's session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientHandle, ClientInfo};
pub use protocol::{AuthorizeParams, StratumMethod, StratumRequest, SubmitParams};
pub use server::StratumServer;

/// Stratum protocol errors
#[derive(Debug, Error)]
pub enum StratumError {
    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// TCP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StratumConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Connection cap; accepts beyond it are dropped
    pub max_connections: usize,

    /// Idle threshold in seconds before a miner socket is closed
    pub timeout_secs: u64,
}

impl Default for StratumConfig {
    fn default() -> Self {
        StratumConfig {
            host: "0.0.0.0".to_string(),
            port: 3333,
            max_connections: 1000,
            timeout_secs: 600,
        }
    }
}
