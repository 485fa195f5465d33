//! TCP accept loop, per-connection tasks, JSON-RPC dispatch, and
//! broadcast fan-out.
//!
//! Each connection runs one reader task (framed line decoding plus
//! dispatch) and one writer task draining an mpsc queue. Broadcasts
//! iterate a snapshot of the client table and never block on a slow
//! miner; a miner-triggered error is answered on the wire and the
//! connection stays open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::{FramedRead, LinesCodec};

use velora_core::Share;
use velora_mining::{
    ClientId, DifficultyController, HashrateEstimator, JobManager, ShareOutcome, ShareValidator,
    ShutdownRx,
};
use velora_storage::Store;
use velora_util::now_ms;

use crate::client::{ClientHandle, ClientInfo};
use crate::protocol::{
    notification, parse_suggested_difficulty, response_error, response_ok, AuthorizeParams,
    StratumMethod, StratumRequest, SubmitParams, ERROR_CODE,
};
use crate::{StratumConfig, StratumError};

/// Maximum accepted line length; miners sending more are misbehaving.
const MAX_LINE_LENGTH: usize = 65536;

/// Outbound queue depth per connection.
const SEND_QUEUE_DEPTH: usize = 100;

pub struct StratumServer {
    config: StratumConfig,
    starting_difficulty: u64,
    jobs: Arc<JobManager>,
    validator: Arc<ShareValidator>,
    difficulty: Arc<DifficultyController>,
    hashrate: Arc<HashrateEstimator>,
    store: Arc<dyn Store>,

    /// Connected miners keyed by client id
    clients: Arc<RwLock<HashMap<ClientId, ClientHandle>>>,
    next_client_id: AtomicU64,
}

impl StratumServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StratumConfig,
        starting_difficulty: u64,
        jobs: Arc<JobManager>,
        validator: Arc<ShareValidator>,
        difficulty: Arc<DifficultyController>,
        hashrate: Arc<HashrateEstimator>,
        store: Arc<dyn Store>,
    ) -> Self {
        StratumServer {
            config,
            starting_difficulty,
            jobs,
            validator,
            difficulty,
            hashrate,
            store,
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_id: AtomicU64::new(1),
        }
    }

    /// Number of connected miners.
    pub fn connected_clients(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Binds the listener; an unbindable endpoint is a fatal startup
    /// error surfaced to the caller.
    pub async fn bind(&self) -> Result<TcpListener, StratumError> {
        let endpoint = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&endpoint).await?;
        info!("Stratum server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Runs the accept loop plus the broadcast and idle-sweep tasks until
    /// shutdown, then closes every miner socket.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownRx) {
        tokio::spawn(self.clone().broadcast_jobs(shutdown.clone()));
        tokio::spawn(self.clone().sweep_idle_clients(shutdown.clone()));
        tokio::spawn(self.clone().persist_miner_stats(shutdown.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, addr)) => {
                            if self.connected_clients() >= self.config.max_connections {
                                warn!("Connection cap reached, dropping {}", addr);
                                continue;
                            }
                            self.clone().handle_connection(socket, addr);
                        }
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("Stratum server stopping, closing {} connection(s)", self.connected_clients());
                    break;
                }
            }
        }

        let handles: Vec<ClientHandle> =
            self.clients.read().unwrap().values().cloned().collect();
        for handle in handles {
            handle.close.notify_one();
        }
    }

    /// Sets up the per-connection tasks.
    fn handle_connection(self: Arc<Self>, socket: TcpStream, addr: std::net::SocketAddr) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        info!("New stratum connection {} from {}", client_id, addr);

        let (tx, mut rx) = mpsc::channel::<String>(SEND_QUEUE_DEPTH);
        let handle = ClientHandle::new(
            ClientInfo::new(client_id, addr, self.starting_difficulty),
            tx,
        );

        self.clients
            .write()
            .unwrap()
            .insert(client_id, handle.clone());

        let (read_half, write_half) = socket.into_split();

        // Writer: drain the outbound queue. Ends when every sender is
        // gone or the socket dies.
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(message) = rx.recv().await {
                trace!("-> {}: {}", addr, message);
                if let Err(e) = writer.write_all(message.as_bytes()).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
                if let Err(e) = writer.write_all(b"\n").await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    debug!("Flush to {} failed: {}", addr, e);
                    break;
                }
            }
        });

        // Reader: framed lines plus dispatch, until EOF, error, or a
        // forced close from the sweep/shutdown paths.
        let server = self;
        tokio::spawn(async move {
            let codec = LinesCodec::new_with_max_length(MAX_LINE_LENGTH);
            let mut lines = FramedRead::new(read_half, codec);

            loop {
                tokio::select! {
                    line = lines.next() => {
                        match line {
                            Some(Ok(line)) => {
                                trace!("<- {}: {}", addr, line);
                                server.handle_line(&handle, &line).await;
                            }
                            Some(Err(e)) => {
                                warn!("Read error from {}: {}", addr, e);
                                break;
                            }
                            None => break,
                        }
                    }
                    _ = handle.close.notified() => {
                        debug!("Connection {} closed by server", client_id);
                        break;
                    }
                }
            }

            server.cleanup_client(client_id);
            info!("Stratum connection {} from {} closed", client_id, addr);
        });
    }

    /// Removes all per-client state after a disconnect.
    fn cleanup_client(&self, client_id: ClientId) {
        self.clients.write().unwrap().remove(&client_id);
        self.difficulty.remove(client_id);
        self.hashrate.remove(client_id);
    }

    /// Parses one wire line and dispatches it. Malformed JSON earns an
    /// error reply; the connection stays open.
    async fn handle_line(&self, handle: &ClientHandle, line: &str) {
        let request: StratumRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                debug!("Malformed request line: {}", e);
                handle.push(response_error(
                    &Value::Null,
                    ERROR_CODE,
                    "Invalid JSON request",
                ));
                return;
            }
        };

        handle.touch();
        let id = request.id.clone();

        // Handlers queue their reply before any follow-up notification so
        // the miner always sees the result line first.
        match StratumMethod::from(request.method.as_str()) {
            StratumMethod::Subscribe => self.on_subscribe(handle, &id),
            StratumMethod::Authorize => self.on_authorize(handle, &id, &request.params, false).await,
            StratumMethod::Login => self.on_authorize(handle, &id, &request.params, true).await,
            StratumMethod::Submit => self.on_submit(handle, &id, &request.params).await,
            StratumMethod::GetTransactions => self.on_get_transactions(handle, &id),
            StratumMethod::SuggestDifficulty => {
                self.on_suggest_difficulty(handle, &id, &request.params)
            }
            StratumMethod::Unknown(method) => {
                debug!("Unknown method {:?}", method);
                handle.push(response_error(&id, ERROR_CODE, "Method not found"));
            }
        }
    }

    /// `mining.subscribe`: advertises the notify capability.
    fn on_subscribe(&self, handle: &ClientHandle, id: &Value) {
        handle.info.lock().unwrap().subscribed = true;
        handle.push(response_ok(id, json!([[["mining.notify"]], null, null])));
    }

    /// `mining.authorize` / `login`: parses `address[.worker]`, registers
    /// the miner, and seeds the difficulty. `login` additionally inlines
    /// the current job in its result.
    async fn on_authorize(
        &self,
        handle: &ClientHandle,
        id: &Value,
        params: &Value,
        inline_job: bool,
    ) {
        let parsed = match AuthorizeParams::parse(params) {
            Ok(parsed) => parsed,
            Err(reason) => {
                handle.push(response_error(id, ERROR_CODE, &reason));
                return;
            }
        };

        let (address, worker) = match parsed.identity() {
            Ok(identity) => identity,
            Err(reason) => {
                handle.push(response_error(id, ERROR_CODE, &reason));
                return;
            }
        };

        let client_id = {
            let mut info = handle.info.lock().unwrap();
            info.subscribed = true;
            info.authorized = true;
            info.address = Some(address.clone());
            info.worker = Some(worker.clone());
            info.id
        };

        // Store failures never reach the miner.
        if let Err(e) = self.store.register_miner(&address, &worker).await {
            error!("Failed to register miner {}.{}: {}", address, worker, e);
        }

        let difficulty = self
            .difficulty
            .register(client_id, self.starting_difficulty, now_ms());
        self.hashrate.register(client_id);
        handle.info.lock().unwrap().difficulty = difficulty;

        info!(
            "Client {} authorized as {}.{} (difficulty {})",
            client_id, address, worker, difficulty
        );

        let current_job = self.jobs.current_job();

        if inline_job {
            let job = current_job
                .as_ref()
                .map(|job| job.notification(difficulty))
                .unwrap_or(Value::Null);
            handle.push(response_ok(
                id,
                json!({
                    "id": format!("{:016x}", client_id),
                    "job": job,
                    "status": "OK"
                }),
            ));
        } else {
            handle.push(response_ok(id, json!(true)));
        }

        handle.push(notification(
            "mining.set_difficulty",
            json!([difficulty]),
        ));

        if !inline_job {
            if let Some(job) = current_job {
                handle.push(notification("job", job.notification(difficulty)));
            }
        }
    }

    /// `mining.submit` / `submit`: share validation and, per outcome,
    /// an eventual difficulty push on the same connection.
    async fn on_submit(&self, handle: &ClientHandle, id: &Value, params: &Value) {
        let snapshot = handle.snapshot();
        let Some((address, worker)) = snapshot.miner_identity() else {
            handle.push(response_error(id, ERROR_CODE, "Not authorized"));
            return;
        };

        let parsed = match SubmitParams::parse(params) {
            Ok(parsed) => parsed,
            Err(reason) => {
                handle.push(response_error(id, ERROR_CODE, &reason));
                return;
            }
        };

        // The difficulty checked is the one active at receive time; a
        // retarget pushed below never re-prices this share.
        let share = Share {
            job_id: parsed.job_id,
            nonce: parsed.nonce,
            ntime: parsed.ntime,
            hash: parsed.hash,
            extra_nonce2: parsed.extra_nonce2,
            worker: parsed.worker.unwrap_or_else(|| worker.clone()),
            difficulty: snapshot.difficulty,
            timestamp: now_ms(),
        };

        let result = self
            .validator
            .process(snapshot.id, &address, &worker, share)
            .await;

        let reply = match &result {
            Ok(ShareOutcome::Accepted) => response_ok(id, json!({"status": "OK"})),
            Ok(ShareOutcome::BlockCandidate) => response_ok(id, json!({"status": "WAIT"})),
            Err(e) => response_error(id, ERROR_CODE, &e.to_string()),
        };
        handle.push(reply);

        if let Some(new_difficulty) =
            self.difficulty
                .record_share(snapshot.id, result.is_ok(), now_ms())
        {
            handle.info.lock().unwrap().difficulty = new_difficulty;
            handle.push(notification(
                "mining.set_difficulty",
                json!([new_difficulty]),
            ));
        }
    }

    /// `mining.get_transactions`: the current job's transaction list.
    fn on_get_transactions(&self, handle: &ClientHandle, id: &Value) {
        if !handle.snapshot().authorized {
            handle.push(response_error(id, ERROR_CODE, "Not authorized"));
            return;
        }

        let reply = match self.jobs.current_job() {
            Some(job) => response_ok(id, json!(job.template.transactions)),
            None => response_error(id, ERROR_CODE, "No block template available"),
        };
        handle.push(reply);
    }

    /// `mining.suggest_difficulty`: clamp and apply.
    fn on_suggest_difficulty(&self, handle: &ClientHandle, id: &Value, params: &Value) {
        let requested = match parse_suggested_difficulty(params) {
            Ok(requested) => requested,
            Err(reason) => {
                handle.push(response_error(id, ERROR_CODE, &reason));
                return;
            }
        };

        let snapshot = handle.snapshot();
        let clamped = self
            .difficulty
            .suggest(snapshot.id, requested, now_ms())
            .unwrap_or_else(|| requested.clamp(1, 1_000_000));
        handle.info.lock().unwrap().difficulty = clamped;

        debug!(
            "Client {} suggested difficulty {} -> {}",
            snapshot.id, requested, clamped
        );
        handle.push(response_ok(id, json!(true)));
    }

    /// Fans new jobs out to every subscribed and authorized miner with
    /// that miner's own pool difficulty in the payload.
    async fn broadcast_jobs(self: Arc<Self>, mut shutdown: ShutdownRx) {
        let mut jobs = self.jobs.subscribe();

        loop {
            tokio::select! {
                event = jobs.recv() => {
                    match event {
                        Ok(job) => {
                            let handles: Vec<ClientHandle> =
                                self.clients.read().unwrap().values().cloned().collect();

                            let mut delivered = 0;
                            for handle in handles.iter().filter(|h| h.wants_jobs()) {
                                let difficulty = handle.snapshot().difficulty;
                                if handle.push(notification("job", job.notification(difficulty))) {
                                    delivered += 1;
                                } else {
                                    warn!("Dropped job notification for a saturated client");
                                }
                            }
                            debug!(
                                "Broadcast job {} (height {}) to {} miner(s)",
                                job.id, job.template.index, delivered
                            );
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Job broadcast lagged {} event(s)", skipped);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Persists per-miner hashrate and lifetime share counts.
    async fn persist_miner_stats(self: Arc<Self>, mut shutdown: ShutdownRx) {
        let mut ticker = time::interval(Duration::from_secs(60));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_ms();
                    let rates: HashMap<ClientId, (f64, u64)> = self
                        .hashrate
                        .snapshot(now)
                        .into_iter()
                        .map(|(id, rate, shares)| (id, (rate, shares)))
                        .collect();

                    let handles: Vec<ClientHandle> =
                        self.clients.read().unwrap().values().cloned().collect();

                    for handle in handles {
                        let info = handle.snapshot();
                        let Some((address, worker)) = info.miner_identity() else {
                            continue;
                        };
                        let (rate, shares) = rates.get(&info.id).copied().unwrap_or((0.0, 0));
                        let key = velora_storage::miner_key(&address, &worker);
                        if let Err(e) = self.store.update_miner_stats(&key, rate, shares, now).await {
                            debug!("Miner stats update for {} skipped: {}", key, e);
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Closes connections idle past the configured threshold.
    async fn sweep_idle_clients(self: Arc<Self>, mut shutdown: ShutdownRx) {
        let mut ticker = time::interval(Duration::from_secs(60));
        let idle_ms = self.config.timeout_secs * 1000;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_ms();
                    let stale: Vec<ClientHandle> = self
                        .clients
                        .read()
                        .unwrap()
                        .values()
                        .filter(|h| now.saturating_sub(h.snapshot().last_activity) > idle_ms)
                        .cloned()
                        .collect();

                    for handle in stale {
                        let info = handle.snapshot();
                        info!(
                            "Closing idle connection {} from {} (inactive {}s)",
                            info.id,
                            info.addr,
                            now.saturating_sub(info.last_activity) / 1000
                        );
                        handle.close.notify_one();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
