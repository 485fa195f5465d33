//! Template management: polling, validation, caching, and change events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time;

use velora_core::Template;
use velora_daemon::DaemonClient;
use velora_util::now_ms;

use crate::{MiningConfig, ShutdownRx};

/// Single source of truth for the current block template.
///
/// Polls the daemon on a fixed interval, validates templates at ingest,
/// and broadcasts an event whenever a refresh yields a strictly higher
/// height. Consumers treat "no template" as a temporary condition and
/// refuse to hand out work.
pub struct TemplateManager {
    daemon: Arc<DaemonClient>,
    pool_address: String,
    starting_difficulty: u64,
    share_timeout_ms: u64,
    poll_interval: Duration,

    /// Cached template; `None` until the first successful poll
    current: RwLock<Option<Arc<Template>>>,

    /// Highest height ever observed, kept past template expiry
    latest_index: AtomicU64,

    /// Re-entry guard: a refresh already in flight drops duplicate calls
    refresh_guard: Mutex<()>,

    /// Fired on refreshes that advance the height
    events: broadcast::Sender<Arc<Template>>,

    /// Nudges the poll task when a consumer observes a stale template
    refresh_notify: Notify,
}

impl TemplateManager {
    pub fn new(daemon: Arc<DaemonClient>, pool_address: String, config: &MiningConfig) -> Self {
        let (events, _) = broadcast::channel(16);

        TemplateManager {
            daemon,
            pool_address,
            starting_difficulty: config.starting_difficulty,
            share_timeout_ms: config.share_timeout_ms,
            poll_interval: Duration::from_secs(config.template_update_interval_secs),
            current: RwLock::new(None),
            latest_index: AtomicU64::new(0),
            refresh_guard: Mutex::new(()),
            events,
            refresh_notify: Notify::new(),
        }
    }

    /// Subscribes to new-template events (strictly increasing heights).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Template>> {
        self.events.subscribe()
    }

    /// Returns the cached template if it has not expired.
    ///
    /// On expiry the poll task is nudged and `None` is returned; callers
    /// must refuse to hand out work until a fresh template arrives.
    pub fn current(&self) -> Option<Arc<Template>> {
        let cached = self.current.read().unwrap().clone();

        match cached {
            Some(template) if !template.is_expired(now_ms()) => Some(template),
            Some(_) => {
                self.refresh_notify.notify_one();
                None
            }
            None => None,
        }
    }

    /// The highest height ever observed, regardless of template expiry.
    ///
    /// Used as the network-height reference for reward confirmations.
    pub fn latest_index(&self) -> u64 {
        self.latest_index.load(Ordering::Relaxed)
    }

    /// Refreshes the template from the daemon.
    ///
    /// Never runs two refreshes concurrently: a call arriving while one is
    /// in flight returns the cached value untouched.
    pub async fn force_update(&self) -> Option<Arc<Template>> {
        let _guard = match self.refresh_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Template refresh already in flight, dropping duplicate call");
                return self.current.read().unwrap().clone();
            }
        };

        let raw = match self.daemon.fetch_template(&self.pool_address).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Template fetch failed: {}", e);
                return None;
            }
        };

        let template =
            match Template::from_daemon(&raw, self.starting_difficulty, self.share_timeout_ms) {
                Ok(template) => Arc::new(template),
                Err(e) => {
                    warn!("Rejected daemon template: {}", e);
                    return None;
                }
            };

        let previous_index = {
            let mut current = self.current.write().unwrap();
            let previous = current.as_ref().map(|t| t.index);
            *current = Some(template.clone());
            previous
        };

        self.latest_index
            .fetch_max(template.index, Ordering::Relaxed);

        let advanced = previous_index.map_or(true, |prev| template.index > prev);
        if advanced {
            info!(
                "New block template: height={}, difficulty={}, pool_difficulty={}",
                template.index, template.difficulty, template.pool_difficulty
            );
            // Nobody listening yet is fine; receivers attach at startup.
            let _ = self.events.send(template.clone());
        } else {
            debug!("Template refresh kept height {}", template.index);
        }

        Some(template)
    }

    /// Installs a template directly, bypassing the daemon. Test hook; the
    /// cache-write and event semantics match `force_update`.
    #[doc(hidden)]
    pub fn set_current_for_tests(&self, template: Arc<Template>) {
        let previous_index = {
            let mut current = self.current.write().unwrap();
            let previous = current.as_ref().map(|t| t.index);
            *current = Some(template.clone());
            previous
        };

        self.latest_index
            .fetch_max(template.index, Ordering::Relaxed);

        if previous_index.map_or(true, |prev| template.index > prev) {
            let _ = self.events.send(template);
        }
    }

    /// Poll loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownRx) {
        let mut ticker = time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.force_update().await;
                }
                _ = self.refresh_notify.notified() => {
                    self.force_update().await;
                }
                _ = shutdown.changed() => {
                    debug!("Template manager stopping");
                    break;
                }
            }
        }
    }
}
