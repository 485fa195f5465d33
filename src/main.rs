//! Velora Pool - Main Entry Point
//!
//! Wires the pool together: configuration, logging, the daemon client,
//! the persistent store, the mining core, and the Stratum endpoint, then
//! runs until interrupted.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::sync::{mpsc, watch};

use velora_core::validate_pool_address;
use velora_crypto::VeloraEngine;
use velora_daemon::DaemonClient;
use velora_database::SqliteStore;
use velora_mining::{
    BlockCoordinator, DifficultyController, HashrateEstimator, JobManager, PoolCounters,
    ProcessingHeights, RewardSplitter, ShareValidator, TemplateManager,
};
use velora_storage::{MemoryStore, Store};
use velora_stratum::StratumServer;

mod config;

use crate::config::Settings;

/// Command line arguments for the Velora pool
#[derive(Parser)]
#[clap(name = "velora-pool")]
#[clap(about = "Stratum mining pool coordinator for Velora proof-of-work chains")]
struct Cli {
    /// Sets a custom config file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Stratum bind port (overrides the config file)
    #[clap(long)]
    port: Option<u16>,

    /// SQLite database path (overrides the config file)
    #[clap(long, value_name = "FILE")]
    database: Option<PathBuf>,

    /// Pool payout address (overrides the config file)
    #[clap(long)]
    pool_address: Option<String>,

    /// Verbosity level (0-4)
    #[clap(short, long, default_value = "2")]
    verbosity: u8,
}

/// Initialize logging based on verbosity level
fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    info!("Starting Velora pool");

    let mut settings = match Settings::load(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Some(port) = cli.port {
        settings.stratum.port = port;
    }
    if let Some(database) = cli.database {
        settings.storage.database_path = Some(database);
    }
    if let Some(pool_address) = cli.pool_address {
        settings.pool.pool_address = pool_address;
    }

    // An unusable payout address would burn every block reward.
    if let Err(e) = validate_pool_address(&settings.pool.pool_address) {
        error!("Invalid pool address {:?}: {}", settings.pool.pool_address, e);
        process::exit(1);
    }

    if settings.mining.algorithm != velora_core::ALGORITHM {
        error!(
            "Unsupported mining algorithm {:?}; this pool speaks {:?} only",
            settings.mining.algorithm,
            velora_core::ALGORITHM
        );
        process::exit(1);
    }

    let daemon = match DaemonClient::new(settings.daemon.clone()) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!("Failed to build daemon client: {}", e);
            process::exit(1);
        }
    };

    if daemon.health().await {
        info!("Daemon reachable at {}", settings.daemon.url);
    } else {
        warn!(
            "Daemon at {} unreachable; miners can connect but receive no work until it recovers",
            settings.daemon.url
        );
    }

    let store: Arc<dyn Store> = match &settings.storage.database_path {
        Some(path) => match SqliteStore::new(path.clone()).await {
            Ok(store) => {
                info!("Using SQLite store at {}", path.display());
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to open database {}: {}", path.display(), e);
                process::exit(1);
            }
        },
        None => {
            warn!("No database configured; accounting is in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    // Mining core, wired leaves-first.
    let templates = Arc::new(TemplateManager::new(
        daemon.clone(),
        settings.pool.pool_address.clone(),
        &settings.mining,
    ));
    let jobs = Arc::new(JobManager::new(templates.clone(), &settings.mining));
    let counters = Arc::new(PoolCounters::new());
    let hashrate = Arc::new(HashrateEstimator::new(settings.hashrate_config()));
    let difficulty = Arc::new(DifficultyController::new(Default::default()));
    let processing = ProcessingHeights::new();
    let engine = Arc::new(VeloraEngine::new());
    let rewards = Arc::new(RewardSplitter::new(store.clone(), settings.reward_config()));

    let (solutions_tx, solutions_rx) = mpsc::channel(64);
    let validator = Arc::new(ShareValidator::new(
        jobs.clone(),
        engine.clone(),
        hashrate.clone(),
        store.clone(),
        counters.clone(),
        processing.clone(),
        solutions_tx,
        settings.mining.share_timeout_ms,
    ));
    let coordinator = Arc::new(BlockCoordinator::new(
        daemon.clone(),
        templates.clone(),
        jobs.clone(),
        store.clone(),
        rewards.clone(),
        engine,
        processing,
        settings.mining.submit_hash_mode,
    ));

    let server = Arc::new(StratumServer::new(
        settings.stratum.clone(),
        settings.mining.starting_difficulty,
        jobs.clone(),
        validator,
        difficulty,
        hashrate.clone(),
        store.clone(),
    ));

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind stratum endpoint: {}", e);
            process::exit(1);
        }
    };

    // First template before miners arrive; a failure here is the
    // daemon-down startup path, not fatal.
    if templates.force_update().await.is_some() {
        jobs.rebuild(true);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(templates.clone().run(shutdown_rx.clone()));
    tokio::spawn(jobs.clone().run(shutdown_rx.clone()));
    tokio::spawn(coordinator.run(solutions_rx, shutdown_rx.clone()));
    tokio::spawn(rewards.run(templates.clone(), shutdown_rx.clone()));
    tokio::spawn(server.clone().serve(listener, shutdown_rx.clone()));

    // Periodic status line.
    {
        let counters = counters.clone();
        let hashrate = hashrate.clone();
        let templates = templates.clone();
        let server = server.clone();
        let block_time = settings.mining.block_time_secs;
        let mut shutdown = shutdown_rx;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = counters.snapshot();
                        info!(
                            "Pool status: {} miner(s), {:.2} H/s, height {}, {}s block target, shares {}/{} valid/invalid ({} stale), {} block(s) found",
                            server.connected_clients(),
                            hashrate.pool_total(velora_util::now_ms()),
                            templates.latest_index(),
                            block_time,
                            snapshot.valid_shares,
                            snapshot.invalid_shares,
                            snapshot.stale_shares,
                            snapshot.blocks_found,
                        );
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    info!(
        "Velora pool running (fee {:.1}%, payout address {})",
        settings.pool.fee * 100.0,
        settings.pool.pool_address
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down: draining in-flight work");
    let _ = shutdown_tx.send(true);

    // Bounded drain for submissions and fire-and-forget persistence.
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Err(e) = store.flush().await {
        warn!("Final store flush failed: {}", e);
    }

    info!("Velora pool stopped");
}
