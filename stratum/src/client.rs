//! Per-connection client state.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use velora_mining::ClientId;
use velora_util::now_ms;

/// Mutable session state for one miner connection.
///
/// Lifecycle: `connected -> subscribed -> authorized`; destroyed on
/// close or error, at which point the difficulty controller and hashrate
/// estimator forget the client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Server-assigned id
    pub id: ClientId,

    /// Remote address
    pub addr: SocketAddr,

    pub connected_at: u64,
    pub last_activity: u64,

    pub subscribed: bool,
    pub authorized: bool,

    /// Wallet address parsed from the login string
    pub address: Option<String>,

    /// Worker name parsed from the login string
    pub worker: Option<String>,

    /// Pool difficulty active for this client
    pub difficulty: u64,
}

impl ClientInfo {
    pub fn new(id: ClientId, addr: SocketAddr, starting_difficulty: u64) -> Self {
        let now = now_ms();
        ClientInfo {
            id,
            addr,
            connected_at: now,
            last_activity: now,
            subscribed: false,
            authorized: false,
            address: None,
            worker: None,
            difficulty: starting_difficulty,
        }
    }

    /// Miner key for storage, available once authorized.
    pub fn miner_identity(&self) -> Option<(String, String)> {
        match (&self.address, &self.worker) {
            (Some(address), Some(worker)) => Some((address.clone(), worker.clone())),
            _ => None,
        }
    }
}

/// Server-side handle to a connected miner.
#[derive(Clone)]
pub struct ClientHandle {
    pub info: Arc<Mutex<ClientInfo>>,

    /// Outbound line queue consumed by the connection's writer task
    pub sender: mpsc::Sender<String>,

    /// Fired to force the connection closed (idle sweep, shutdown)
    pub close: Arc<Notify>,
}

impl ClientHandle {
    pub fn new(info: ClientInfo, sender: mpsc::Sender<String>) -> Self {
        ClientHandle {
            info: Arc::new(Mutex::new(info)),
            sender,
            close: Arc::new(Notify::new()),
        }
    }

    /// Queues a line for the miner without blocking; a slow miner's full
    /// queue drops the message rather than stalling the caller.
    pub fn push(&self, line: String) -> bool {
        self.sender.try_send(line).is_ok()
    }

    pub fn touch(&self) {
        self.info.lock().unwrap().last_activity = now_ms();
    }

    pub fn snapshot(&self) -> ClientInfo {
        self.info.lock().unwrap().clone()
    }

    /// Whether the client should receive job broadcasts.
    pub fn wants_jobs(&self) -> bool {
        let info = self.info.lock().unwrap();
        info.subscribed && info.authorized
    }
}
