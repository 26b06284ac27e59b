//! Crawl job queue policy over the persistent store.
//!
//! The store provides atomic enqueue-dedup and claim operations; this layer
//! owns the policy knobs: seed vs. discovered priorities, the freshness
//! window, and the retry/backoff state machine for failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sponsorgraph_common::{
    CrawlJob, EnqueueOutcome, BACKFILL_PRIORITY, DISCOVERED_PRIORITY, SEED_PRIORITY,
};

use crate::backoff;
use crate::traits::GraphStore;

#[derive(Clone)]
pub struct QueuePolicy {
    /// How long a `done` entity stays fresh (not re-enqueuable by discovery).
    pub freshness: chrono::Duration,
    /// Attempts after which a retryable failure becomes terminal.
    pub retry_ceiling: i32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// How long an in_progress claim may go untouched before it is assumed
    /// lost to a crashed worker and released.
    pub abandoned_timeout: chrono::Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            freshness: chrono::Duration::days(7),
            retry_ceiling: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(900),
            abandoned_timeout: chrono::Duration::hours(1),
        }
    }
}

pub struct JobQueue {
    store: Arc<dyn GraphStore>,
    policy: QueuePolicy,
}

impl JobQueue {
    pub fn new(store: Arc<dyn GraphStore>, policy: QueuePolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Enqueue an externally requested seed at depth 0, highest priority.
    pub async fn enqueue_seed(&self, login: &str, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        let login = normalize_login(login);
        let outcome = self
            .store
            .enqueue_job(&login, 0, SEED_PRIORITY, now - self.policy.freshness, now)
            .await?;
        match outcome {
            EnqueueOutcome::Queued { job_id } => {
                info!(login = login.as_str(), %job_id, "Seed enqueued")
            }
            EnqueueOutcome::Duplicate { job_id } => {
                debug!(login = login.as_str(), %job_id, "Seed already queued")
            }
        }
        Ok(outcome)
    }

    /// Enqueue a neighbor discovered through an edge.
    pub async fn enqueue_discovered(
        &self,
        login: &str,
        depth: i32,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let login = normalize_login(login);
        self.store
            .enqueue_job(
                &login,
                depth,
                DISCOVERED_PRIORITY,
                now - self.policy.freshness,
                now,
            )
            .await
    }

    /// Enqueue a user found by the sponsorable-search backfill: depth 0 like
    /// a seed, but at the lowest priority so real work always runs first.
    pub async fn enqueue_backfill(
        &self,
        login: &str,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let login = normalize_login(login);
        self.store
            .enqueue_job(&login, 0, BACKFILL_PRIORITY, now - self.policy.freshness, now)
            .await
    }

    /// Claim the next eligible job, or None when the queue is drained.
    pub async fn dequeue(&self, now: DateTime<Utc>) -> Result<Option<CrawlJob>> {
        self.store.dequeue_job(now).await
    }

    pub async fn complete(
        &self,
        job: &CrawlJob,
        github_id: i64,
        new_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store
            .complete_job(job.id, github_id, new_priority, now)
            .await
    }

    /// Record a job failure. Retryable failures under the ceiling go back to
    /// pending with an exponential-backoff delay; everything else is terminal.
    pub async fn fail(
        &self,
        job: &CrawlJob,
        retryable: bool,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if retryable && job.attempts < self.policy.retry_ceiling {
            let next = backoff::next_eligible(
                now,
                self.policy.backoff_base,
                self.policy.backoff_cap,
                job.attempts.max(0) as u32,
            );
            warn!(
                login = job.login.as_str(),
                attempts = job.attempts,
                next_eligible_at = %next,
                error,
                "Job failed, rescheduling"
            );
            self.store.reschedule_job(job.id, next, error, now).await
        } else {
            warn!(
                login = job.login.as_str(),
                attempts = job.attempts,
                retryable,
                error,
                "Job failed terminally"
            );
            self.store.fail_job(job.id, error, now).await
        }
    }

    /// Rate-limit deferral: not a failure. The job returns to pending,
    /// eligible at the budget's reset time, attempt count untouched.
    pub async fn defer(&self, job: &CrawlJob, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        debug!(login = job.login.as_str(), until = %until, "Job deferred for rate limit");
        self.store.defer_job(job.id, until, now).await
    }

    /// Maintenance: re-open done jobs whose entities fell out of the
    /// freshness window.
    pub async fn requeue_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.policy.freshness;
        let reopened = self.store.requeue_stale(cutoff, now).await?;
        if reopened > 0 {
            info!(reopened, "Re-enqueued stale entities");
        }
        Ok(reopened)
    }

    /// Maintenance: release claims stranded by a crashed worker back to
    /// pending once they have sat untouched past the abandonment timeout.
    pub async fn reclaim_abandoned(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - self.policy.abandoned_timeout;
        let released = self.store.reclaim_abandoned(cutoff, now).await?;
        if released > 0 {
            warn!(released, "Reclaimed abandoned in-progress jobs");
        }
        Ok(released)
    }

    pub async fn job(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        self.store.get_job(id).await
    }

    pub async fn job_by_login(&self, login: &str) -> Result<Option<CrawlJob>> {
        self.store.get_job_by_login(&normalize_login(login)).await
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }
}

/// GitHub logins are case-insensitive; the queue dedups on the lowercase form.
pub fn normalize_login(login: &str) -> String {
    login.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;
    use sponsorgraph_common::JobState;

    fn queue() -> (Arc<MemoryStore>, JobQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), QueuePolicy::default());
        (store, queue)
    }

    #[tokio::test]
    async fn seed_enqueue_dedups_by_login() {
        let (_, queue) = queue();
        let now = Utc::now();

        let first = queue.enqueue_seed("Octocat", now).await.unwrap();
        assert!(first.is_queued());

        // Same login, different case and whitespace: dedup no-op.
        let second = queue.enqueue_seed(" octocat ", now).await.unwrap();
        assert!(!second.is_queued());
        assert_eq!(first.job_id(), second.job_id());
    }

    #[tokio::test]
    async fn at_most_one_live_job_per_login() {
        let (_, queue) = queue();
        let now = Utc::now();

        queue.enqueue_seed("octocat", now).await.unwrap();
        let job = queue.dequeue(now).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::InProgress);

        // Still deduped while in progress.
        let again = queue.enqueue_discovered("octocat", 1, now).await.unwrap();
        assert!(!again.is_queued());

        // And nothing else to dequeue.
        assert!(queue.dequeue(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_is_breadth_first() {
        let (_, queue) = queue();
        let now = Utc::now();

        // Enqueue out of order: depths [2, 1, 0, 1].
        queue.enqueue_discovered("deep", 2, now).await.unwrap();
        queue.enqueue_discovered("mid-a", 1, now).await.unwrap();
        queue.enqueue_seed("seed", now).await.unwrap();
        queue.enqueue_discovered("mid-b", 1, now).await.unwrap();

        let order: Vec<(String, i32)> = {
            let mut out = Vec::new();
            while let Some(job) = queue.dequeue(now).await.unwrap() {
                out.push((job.login.clone(), job.depth));
            }
            out
        };

        assert_eq!(
            order,
            vec![
                ("seed".to_string(), 0),
                ("mid-a".to_string(), 1),
                ("mid-b".to_string(), 1),
                ("deep".to_string(), 2),
            ]
        );
    }

    #[tokio::test]
    async fn same_depth_orders_by_priority_then_fifo() {
        let (store, queue) = queue();
        let now = Utc::now();

        queue.enqueue_discovered("low-first", 1, now).await.unwrap();
        queue.enqueue_discovered("low-second", 1, now).await.unwrap();
        // A seed-priority job at the same depth jumps the line.
        store
            .enqueue_job("urgent", 1, SEED_PRIORITY, now - chrono::Duration::days(7), now)
            .await
            .unwrap();

        let first = queue.dequeue(now).await.unwrap().unwrap();
        let second = queue.dequeue(now).await.unwrap().unwrap();
        let third = queue.dequeue(now).await.unwrap().unwrap();
        assert_eq!(first.login, "urgent");
        assert_eq!(second.login, "low-first");
        assert_eq!(third.login, "low-second");
    }

    #[tokio::test]
    async fn retryable_failure_backs_off_then_exhausts() {
        let (_, queue) = queue();
        let now = Utc::now();

        queue.enqueue_seed("flaky", now).await.unwrap();

        // Attempts 1 and 2: rescheduled with a future eligibility.
        let mut when = now;
        for expected_attempts in 1..=2 {
            let job = queue.dequeue(when).await.unwrap().unwrap();
            assert_eq!(job.attempts, expected_attempts);
            queue.fail(&job, true, "503", when).await.unwrap();
            let stored = queue.job(job.id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::Pending);
            assert!(stored.next_eligible_at > when);
            // Not eligible again until the backoff elapses.
            assert!(queue.dequeue(when).await.unwrap().is_none());
            when += chrono::Duration::hours(1);
        }

        // Third attempt hits the ceiling and fails terminally.
        let job = queue.dequeue(when).await.unwrap().unwrap();
        assert_eq!(job.attempts, 3);
        queue.fail(&job, true, "503", when).await.unwrap();
        let stored = queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_immediately() {
        let (_, queue) = queue();
        let now = Utc::now();

        queue.enqueue_seed("ghost-user", now).await.unwrap();
        let job = queue.dequeue(now).await.unwrap().unwrap();
        queue.fail(&job, false, "not found", now).await.unwrap();

        let stored = queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }

    #[tokio::test]
    async fn failed_jobs_can_be_reenqueued() {
        let (_, queue) = queue();
        let now = Utc::now();

        queue.enqueue_seed("ghost-user", now).await.unwrap();
        let job = queue.dequeue(now).await.unwrap().unwrap();
        queue.fail(&job, false, "not found", now).await.unwrap();

        // A fresh external request resurrects the failed job.
        let outcome = queue.enqueue_seed("ghost-user", now).await.unwrap();
        assert!(outcome.is_queued());
        let stored = queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn abandoned_claims_are_reclaimed_after_timeout() {
        let (_, queue) = queue();
        let now = Utc::now();

        queue.enqueue_seed("octocat", now).await.unwrap();
        let job = queue.dequeue(now).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::InProgress);

        // Before the timeout the claim is left alone.
        let soon = now + chrono::Duration::minutes(30);
        assert_eq!(queue.reclaim_abandoned(soon).await.unwrap(), 0);
        assert!(queue.dequeue(soon).await.unwrap().is_none());

        // Past the timeout it is released and dequeuable again.
        let later = now + chrono::Duration::hours(2);
        assert_eq!(queue.reclaim_abandoned(later).await.unwrap(), 1);
        let reclaimed = queue.dequeue(later).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.state, JobState::InProgress);
    }

    #[tokio::test]
    async fn backfill_enqueues_behind_all_other_work() {
        let (_, queue) = queue();
        let now = Utc::now();

        queue.enqueue_backfill("found-by-search", now).await.unwrap();
        queue.enqueue_seed("requested", now).await.unwrap();

        // Both at depth 0, but the seed's priority wins.
        let first = queue.dequeue(now).await.unwrap().unwrap();
        let second = queue.dequeue(now).await.unwrap().unwrap();
        assert_eq!(first.login, "requested");
        assert_eq!(second.login, "found-by-search");
        assert_eq!(second.priority, BACKFILL_PRIORITY);
    }

    #[tokio::test]
    async fn deferral_keeps_attempt_count() {
        let (_, queue) = queue();
        let now = Utc::now();
        let reset = now + chrono::Duration::minutes(30);

        queue.enqueue_seed("octocat", now).await.unwrap();
        let job = queue.dequeue(now).await.unwrap().unwrap();
        queue.defer(&job, reset, now).await.unwrap();

        let stored = queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.next_eligible_at, reset);
        // The claim's attempt increment is given back: deferral is
        // scheduling, not failure.
        assert_eq!(stored.attempts, 0);
        assert!(queue.dequeue(now).await.unwrap().is_none());
        assert!(queue.dequeue(reset).await.unwrap().is_some());
    }
}
