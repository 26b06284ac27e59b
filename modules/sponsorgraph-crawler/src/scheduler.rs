//! Worker pool and maintenance loops.
//!
//! The scheduler owns N identical worker loops pulling from the shared queue
//! plus one maintenance loop that re-opens stale entities, reclaims claims
//! lost to crashed workers, and backfills an idle queue from the sponsorable
//! search. All loops observe a shared shutdown signal and exit between jobs,
//! never mid-job.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::queue::JobQueue;
use crate::rate_limit::RateLimiter;
use crate::worker::CrawlWorker;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    /// Sleep between polls while the queue is empty.
    pub idle_poll: Duration,
    /// How often the maintenance loop looks for stale entities.
    pub stale_check_interval: Duration,
    /// Search pages fetched when backfilling an idle queue. The search API
    /// serves at most 1000 results (10 pages of 100) per query anyway.
    pub backfill_pages: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            idle_poll: Duration::from_secs(5),
            stale_check_interval: Duration::from_secs(4 * 3600),
            backfill_pages: 10,
        }
    }
}

pub struct Scheduler {
    queue: Arc<JobQueue>,
    worker: Arc<CrawlWorker>,
    limiter: Arc<RateLimiter>,
    config: SchedulerConfig,
    shutdown: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<JobQueue>,
        worker: Arc<CrawlWorker>,
        limiter: Arc<RateLimiter>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            worker,
            limiter,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown signal flips. Resolves once every loop has
    /// finished its in-flight work.
    pub async fn run(self) -> Result<()> {
        info!(workers = self.config.workers, "Starting crawl scheduler");

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for n in 0..self.config.workers {
            handles.push(tokio::spawn(worker_loop(
                n,
                self.queue.clone(),
                self.worker.clone(),
                self.limiter.clone(),
                self.config.idle_poll,
                self.shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(maintenance_loop(
            self.queue.clone(),
            self.worker.clone(),
            self.config.stale_check_interval,
            self.config.backfill_pages,
            self.shutdown.clone(),
        )));

        for result in futures::future::join_all(handles).await {
            if let Err(err) = result {
                error!(error = %err, "Scheduler task panicked");
            }
        }
        info!("Crawl scheduler stopped");
        Ok(())
    }
}

async fn worker_loop(
    n: usize,
    queue: Arc<JobQueue>,
    worker: Arc<CrawlWorker>,
    limiter: Arc<RateLimiter>,
    idle_poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = n, "Worker loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Don't claim a job the budget cannot pay for; park until the reset.
        if let Some(until) = limiter.deferral(Utc::now()).await {
            let wait = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(worker = n, until = %until, "Budget exhausted, worker parked");
            if interrupted_sleep(wait, &mut shutdown).await {
                break;
            }
            continue;
        }

        match worker.run_once().await {
            Ok(Some(outcome)) => {
                debug!(worker = n, ?outcome, "Job processed");
            }
            Ok(None) => {
                if interrupted_sleep(idle_poll, &mut shutdown).await {
                    break;
                }
            }
            Err(err) => {
                // Queue-level failure (store down, etc). Log and retreat; the
                // claimed job, if any, stays in_progress for manual triage.
                error!(worker = n, error = %err, "Worker iteration failed");
                if interrupted_sleep(idle_poll, &mut shutdown).await {
                    break;
                }
            }
        }
    }
    debug!(worker = n, "Worker loop stopped");
}

/// Runs its work first, then sleeps, so a cold start with an empty queue
/// gets backfilled immediately instead of after the first interval.
async fn maintenance_loop(
    queue: Arc<JobQueue>,
    worker: Arc<CrawlWorker>,
    interval: Duration,
    backfill_pages: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        if let Err(err) = queue.reclaim_abandoned(now).await {
            error!(error = %err, "Abandoned-job reclaim failed");
        }
        if let Err(err) = queue.requeue_stale(now).await {
            error!(error = %err, "Stale re-enqueue failed");
        }
        // Nothing pending or claimed: top the queue up from the search.
        match queue.store().count_unfinished_jobs().await {
            Ok(0) => {
                if let Err(err) = worker.seed_from_search(backfill_pages).await {
                    error!(error = %err, "Backfill seeding failed");
                }
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "Queue depth check failed"),
        }
        if interrupted_sleep(interval, &mut shutdown).await {
            break;
        }
    }
    debug!("Maintenance loop stopped");
}

/// Sleep for `dur`, returning true if shutdown fired first.
async fn interrupted_sleep(dur: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = shutdown.changed() => true,
    }
}
