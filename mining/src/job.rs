//! Job management: turning templates into miner work and driving
//! distribution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::broadcast;
use tokio::time;

use velora_core::Job;
use velora_util::now_ms;

use crate::template::TemplateManager;
use crate::{MiningConfig, ShutdownRx};

/// Owns the job table and job broadcasts.
///
/// New templates produce jobs with `clean_jobs=true`; a periodic tick
/// regenerates work at the same height so timestamps advance. Expired jobs
/// are swept opportunistically.
pub struct JobManager {
    templates: Arc<TemplateManager>,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    next_id: AtomicU64,
    refresh_interval: Duration,
    events: broadcast::Sender<Arc<Job>>,
}

impl JobManager {
    pub fn new(templates: Arc<TemplateManager>, config: &MiningConfig) -> Self {
        let (events, _) = broadcast::channel(32);

        JobManager {
            templates,
            jobs: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            refresh_interval: Duration::from_secs(config.job_refresh_interval_secs),
            events,
        }
    }

    /// Subscribes to job broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Job>> {
        self.events.subscribe()
    }

    /// Looks up a job by id.
    pub fn get(&self, job_id: &str) -> Option<Arc<Job>> {
        self.jobs.read().unwrap().get(job_id).cloned()
    }

    /// Returns the most recent unexpired job, sweeping dead entries.
    pub fn current_job(&self) -> Option<Arc<Job>> {
        let now = now_ms();
        let mut jobs = self.jobs.write().unwrap();
        jobs.retain(|_, job| !job.is_expired(now));

        jobs.values().max_by_key(|job| job.created_at).cloned()
    }

    /// Deletes every job built on a template at the given height.
    ///
    /// Called after a successful block submission so the same height
    /// cannot be solved twice.
    pub fn invalidate_height(&self, height: u64) -> usize {
        let mut jobs = self.jobs.write().unwrap();
        let before = jobs.len();
        jobs.retain(|_, job| job.template.index != height);

        let removed = before - jobs.len();
        if removed > 0 {
            info!("Invalidated {} job(s) at height {}", removed, height);
        }
        removed
    }

    /// Builds a new job from the current template and broadcasts it.
    ///
    /// Returns `None` while no template is available; miners keep their
    /// previous work until the daemon recovers.
    pub fn rebuild(&self, clean_jobs: bool) -> Option<Arc<Job>> {
        let template = self.templates.current()?;
        let now = now_ms();

        let id = format!("{:016x}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Job::new(id, template, now, clean_jobs));

        {
            let mut jobs = self.jobs.write().unwrap();
            jobs.retain(|_, existing| !existing.is_expired(now));
            jobs.insert(job.id.clone(), job.clone());
        }

        debug!(
            "New job {} at height {} (clean={})",
            job.id, job.template.index, clean_jobs
        );
        let _ = self.events.send(job.clone());

        Some(job)
    }

    /// Drives job generation until shutdown: template changes produce
    /// clean jobs, the periodic tick refreshes work in place.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownRx) {
        let mut template_events = self.templates.subscribe();
        let mut ticker = time::interval(self.refresh_interval);
        // The immediate first tick would race the initial template poll.
        ticker.tick().await;

        loop {
            tokio::select! {
                event = template_events.recv() => {
                    match event {
                        Ok(_template) => {
                            self.rebuild(true);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Job manager lagged {} template events", skipped);
                            self.rebuild(true);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = ticker.tick() => {
                    self.rebuild(false);
                }
                _ = shutdown.changed() => {
                    debug!("Job manager stopping");
                    break;
                }
            }
        }
    }
}
