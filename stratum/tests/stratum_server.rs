//! Wire-level tests: a real TCP client speaking line-JSON against a full
//! server stack backed by the in-memory store and an offline daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use velora_core::{target_for_difficulty, to_hash_hex, Template};
use velora_crypto::VeloraEngine;
use velora_daemon::{DaemonClient, DaemonConfig};
use velora_mining::{
    BlockSolution, DifficultyController, HashrateEstimator, JobManager, MiningConfig,
    PoolCounters, ProcessingHeights, ShareValidator, TemplateManager,
};
use velora_storage::{MemoryStore, Store};
use velora_stratum::{StratumConfig, StratumServer};

const NETWORK_DIFFICULTY: u64 = 1_000_000;
const STARTING_DIFFICULTY: u64 = 100;

struct Pool {
    addr: SocketAddr,
    _shutdown: watch::Sender<bool>,
    _solutions: mpsc::Receiver<BlockSolution>,
    store: Arc<MemoryStore>,
}

async fn start_pool(with_template: bool) -> Pool {
    let daemon = Arc::new(
        DaemonClient::new(DaemonConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
            ..Default::default()
        })
        .unwrap(),
    );

    let mining_config = MiningConfig {
        starting_difficulty: STARTING_DIFFICULTY,
        ..Default::default()
    };
    let templates = Arc::new(TemplateManager::new(
        daemon,
        "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".to_string(),
        &mining_config,
    ));

    if with_template {
        let raw = json!({
            "index": 100,
            "previousHash": "ab".repeat(32),
            "merkleRoot": "cd".repeat(32),
            "timestamp": velora_util::now_ms(),
            "difficulty": NETWORK_DIFFICULTY,
            "transactions": [{"isCoinbase": true, "amount": 50}]
        });
        templates.set_current_for_tests(Arc::new(
            Template::from_daemon(&raw, STARTING_DIFFICULTY, 300_000).unwrap(),
        ));
    }

    let jobs = Arc::new(JobManager::new(templates, &mining_config));
    if with_template {
        jobs.rebuild(true).unwrap();
    }

    let store = Arc::new(MemoryStore::new());
    let counters = Arc::new(PoolCounters::new());
    let hashrate = Arc::new(HashrateEstimator::new(Default::default()));
    let (solutions_tx, solutions_rx) = mpsc::channel(8);

    let validator = Arc::new(ShareValidator::new(
        jobs.clone(),
        Arc::new(VeloraEngine::new()),
        hashrate.clone(),
        store.clone(),
        counters,
        ProcessingHeights::new(),
        solutions_tx,
        mining_config.share_timeout_ms,
    ));

    let server = Arc::new(StratumServer::new(
        StratumConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        },
        STARTING_DIFFICULTY,
        jobs,
        validator,
        Arc::new(DifficultyController::new(Default::default())),
        hashrate,
        store.clone(),
    ));

    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server.serve(listener, shutdown_rx));

    Pool {
        addr,
        _shutdown: shutdown_tx,
        _solutions: solutions_rx,
        store,
    }
}

struct Miner {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Miner {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        let (read_half, writer) = socket.into_split();
        Miner {
            lines: BufReader::new(read_half).lines(),
            writer,
        }
    }

    async fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn send_raw(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let line = timeout(Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("connection closed");
        serde_json::from_str(&line).unwrap()
    }

    /// Next response with the given id, skipping notifications.
    async fn response(&mut self, id: u64) -> Value {
        loop {
            let message = self.recv().await;
            if message["id"] == json!(id) {
                return message;
            }
        }
    }

    /// Next notification with the given method, skipping everything else.
    async fn notification(&mut self, method: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["method"] == json!(method) {
                return message;
            }
        }
    }

    async fn authorize(&mut self, id: u64, login: &str) {
        self.send(json!({
            "id": id,
            "method": "mining.authorize",
            "params": [login, "x"]
        }))
        .await;
        let reply = self.response(id).await;
        assert_eq!(reply["result"], json!(true));
    }
}

fn share_hash() -> String {
    to_hash_hex(&target_for_difficulty(STARTING_DIFFICULTY))
}

#[tokio::test]
async fn test_subscribe_reply_shape() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner
        .send(json!({"id": 1, "method": "mining.subscribe", "params": []}))
        .await;
    let reply = miner.response(1).await;

    assert_eq!(reply["result"], json!([[["mining.notify"]], null, null]));
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn test_authorize_pushes_difficulty_and_job() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner.authorize(2, "1MinerAddr.rig1").await;

    let difficulty = miner.notification("mining.set_difficulty").await;
    assert_eq!(difficulty["params"], json!([STARTING_DIFFICULTY]));

    let job = miner.notification("job").await;
    assert_eq!(job["params"]["height"], 100);
    assert_eq!(job["params"]["pool_difficulty"], STARTING_DIFFICULTY);
    assert_eq!(job["params"]["algo"], "velora");
}

#[tokio::test]
async fn test_login_inlines_job() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner
        .send(json!({
            "id": 3,
            "method": "login",
            "params": {"user": "1MinerAddr.rig1", "pass": "x"}
        }))
        .await;
    let reply = miner.response(3).await;

    assert_eq!(reply["result"]["status"], "OK");
    assert_eq!(reply["result"]["job"]["height"], 100);
    assert_eq!(reply["result"]["job"]["difficulty"], NETWORK_DIFFICULTY);
    assert!(reply["result"]["id"].is_string());
}

#[tokio::test]
async fn test_login_without_template_still_succeeds() {
    let pool = start_pool(false).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner
        .send(json!({
            "id": 4,
            "method": "login",
            "params": {"user": "1MinerAddr.rig1", "pass": "x"}
        }))
        .await;
    let reply = miner.response(4).await;

    assert_eq!(reply["result"]["status"], "OK");
    assert!(reply["result"]["job"].is_null());
}

#[tokio::test]
async fn test_submit_requires_authorization() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner
        .send(json!({
            "id": 5,
            "method": "mining.submit",
            "params": {"jobId": "01", "nonce": "deadbeef", "nTime": "0", "result": "00"}
        }))
        .await;
    let reply = miner.response(5).await;

    assert!(reply["result"].is_null());
    assert_eq!(reply["error"][0], -1);
    assert_eq!(reply["error"][1], "Not authorized");
}

#[tokio::test]
async fn test_unknown_method() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner
        .send(json!({"id": 6, "method": "mining.capabilities", "params": []}))
        .await;
    let reply = miner.response(6).await;
    assert_eq!(reply["error"][1], "Method not found");
}

#[tokio::test]
async fn test_malformed_line_keeps_connection_open() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;

    miner.send_raw("this is not json\n").await;
    let reply = miner.recv().await;
    assert_eq!(reply["error"][1], "Invalid JSON request");

    // The connection survives and keeps dispatching.
    miner
        .send(json!({"id": 7, "method": "mining.subscribe", "params": []}))
        .await;
    let reply = miner.response(7).await;
    assert!(reply["error"].is_null());
}

#[tokio::test]
async fn test_submit_accepted_share() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;
    miner.authorize(8, "1MinerAddr.rig1").await;

    let job = miner.notification("job").await;
    let job_id = job["params"]["job_id"].as_str().unwrap().to_string();

    miner
        .send(json!({
            "id": 9,
            "method": "mining.submit",
            "params": {
                "jobId": job_id,
                "nonce": "deadbeef",
                "nTime": format!("{:x}", velora_util::now_secs()),
                "result": share_hash()
            }
        }))
        .await;
    let reply = miner.response(9).await;
    assert_eq!(reply["result"]["status"], "OK");

    // The accepted share lands in the store (fire-and-forget write).
    tokio::time::sleep(Duration::from_millis(50)).await;
    let shares = pool.store.shares_since(0).await.unwrap();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0].address, "1MinerAddr");
}

#[tokio::test]
async fn test_submit_low_difficulty_rejected() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;
    miner.authorize(10, "1MinerAddr.rig1").await;

    let job = miner.notification("job").await;
    let job_id = job["params"]["job_id"].as_str().unwrap().to_string();

    // All-f hash: maximal value, meets no target.
    miner
        .send(json!({
            "id": 11,
            "method": "mining.submit",
            "params": {
                "jobId": job_id,
                "nonce": "deadbeef",
                "nTime": format!("{:x}", velora_util::now_secs()),
                "result": "f".repeat(64)
            }
        }))
        .await;
    let reply = miner.response(11).await;
    assert_eq!(reply["error"][1], "Low difficulty share");
}

#[tokio::test]
async fn test_submit_unknown_job_rejected() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;
    miner.authorize(12, "1MinerAddr.rig1").await;

    miner
        .send(json!({
            "id": 13,
            "method": "mining.submit",
            "params": {
                "jobId": "ffffffffffffffff",
                "nonce": "deadbeef",
                "nTime": format!("{:x}", velora_util::now_secs()),
                "result": share_hash()
            }
        }))
        .await;
    let reply = miner.response(13).await;
    assert_eq!(reply["error"][1], "Job not found");
}

#[tokio::test]
async fn test_submit_without_template() {
    let pool = start_pool(false).await;
    let mut miner = Miner::connect(pool.addr).await;
    miner.authorize(14, "1MinerAddr.rig1").await;

    miner
        .send(json!({
            "id": 15,
            "method": "mining.submit",
            "params": {
                "jobId": "01",
                "nonce": "deadbeef",
                "nTime": format!("{:x}", velora_util::now_secs()),
                "result": share_hash()
            }
        }))
        .await;
    let reply = miner.response(15).await;
    assert_eq!(reply["error"][1], "No block template available");
}

#[tokio::test]
async fn test_get_transactions() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;
    miner.authorize(16, "1MinerAddr.rig1").await;

    miner
        .send(json!({"id": 17, "method": "mining.get_transactions", "params": []}))
        .await;
    let reply = miner.response(17).await;

    let transactions = reply["result"].as_array().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0]["isCoinbase"], true);
}

#[tokio::test]
async fn test_suggest_difficulty_clamps_and_applies() {
    let pool = start_pool(true).await;
    let mut miner = Miner::connect(pool.addr).await;
    miner.authorize(18, "1MinerAddr.rig1").await;

    let job = miner.notification("job").await;
    let job_id = job["params"]["job_id"].as_str().unwrap().to_string();

    // 5M clamps to the 1M ceiling and takes effect immediately.
    miner
        .send(json!({
            "id": 19,
            "method": "mining.suggest_difficulty",
            "params": [5_000_000]
        }))
        .await;
    let reply = miner.response(19).await;
    assert_eq!(reply["result"], json!(true));

    // A share at the old difficulty-100 target now misses the clamped
    // million-difficulty target.
    miner
        .send(json!({
            "id": 20,
            "method": "mining.submit",
            "params": {
                "jobId": job_id,
                "nonce": "deadbeef",
                "nTime": format!("{:x}", velora_util::now_secs()),
                "result": share_hash()
            }
        }))
        .await;
    let reply = miner.response(20).await;
    assert_eq!(reply["error"][1], "Low difficulty share");
}

#[tokio::test]
async fn test_two_miners_do_not_interfere() {
    let pool = start_pool(true).await;

    let mut alice = Miner::connect(pool.addr).await;
    let mut bob = Miner::connect(pool.addr).await;

    alice.authorize(21, "1AliceAddr.rig1").await;
    // Bob sends garbage; Alice's session is untouched.
    bob.send_raw("garbage\n").await;
    let _ = bob.recv().await;

    alice
        .send(json!({"id": 22, "method": "mining.subscribe", "params": []}))
        .await;
    let reply = alice.response(22).await;
    assert!(reply["error"].is_null());
}
