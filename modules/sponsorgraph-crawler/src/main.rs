use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use github_client::GitHubClient;
use sponsorgraph_common::Config;
use sponsorgraph_crawler::{
    CrawlWorker, GitHubUpstream, JobQueue, QueuePolicy, RateLimiter, Scheduler, SchedulerConfig,
    UpstreamPolicy,
};
use sponsorgraph_graph::{migrate, PgStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("sponsorgraph=info".parse()?))
        .init();

    info!("SponsorGraph crawler starting...");

    let config = Config::from_env();

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    migrate(store.pool()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let limiter = Arc::new(RateLimiter::new());
    let upstream = Arc::new(GitHubUpstream::new(
        GitHubClient::new(config.github_token.clone()),
        limiter.clone(),
        UpstreamPolicy {
            max_attempts: config.retry_ceiling.max(1) as u32,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
        },
        shutdown_rx.clone(),
    ));

    let queue = Arc::new(JobQueue::new(
        store.clone(),
        QueuePolicy {
            freshness: chrono::Duration::days(config.freshness_days),
            retry_ceiling: config.retry_ceiling,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            abandoned_timeout: chrono::Duration::from_std(config.abandoned_timeout)?,
        },
    ));

    let worker = Arc::new(CrawlWorker::new(
        store,
        queue.clone(),
        upstream,
        config.max_depth,
    ));

    let scheduler = Scheduler::new(
        queue,
        worker,
        limiter,
        SchedulerConfig {
            workers: config.worker_count,
            idle_poll: config.idle_poll,
            stale_check_interval: config.stale_check_interval,
            backfill_pages: config.backfill_pages,
        },
        shutdown_rx,
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, draining workers");
            let _ = shutdown_tx.send(true);
        }
    });

    scheduler.run().await
}
