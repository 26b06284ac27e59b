//! The crawl worker: one job in, one entity fully crawled out.
//!
//! A job iteration fetches the profile, upserts the entity, walks every page
//! of both edge directions, records edges, enqueues unseen neighbors one
//! level deeper, then finalizes the scrape. All side effects go through the
//! GraphStore and JobQueue — no network calls bypass the Upstream seam.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Utc};
use tracing::{debug, info, warn};

use sponsorgraph_common::{
    CrawlJob, EdgeDirection, EntityKind, Profile, MAX_PRIORITY, MIN_PRIORITY,
};

use crate::queue::JobQueue;
use crate::traits::{GraphStore, Upstream, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { neighbors: usize, new_jobs: usize },
    /// Account gone upstream: entity tombstoned, job terminally failed.
    Tombstoned,
    /// Budget exhausted: job back to pending at the reset time.
    Deferred,
    /// Transient or store failure: job failed via the retry state machine.
    Failed,
}

pub struct CrawlWorker {
    store: Arc<dyn GraphStore>,
    queue: Arc<JobQueue>,
    upstream: Arc<dyn Upstream>,
    /// Neighbors are enqueued only while `depth + 1 <= max_depth`. Seeds
    /// (depth 0) are never subject to this cutoff.
    max_depth: i32,
}

impl CrawlWorker {
    pub fn new(
        store: Arc<dyn GraphStore>,
        queue: Arc<JobQueue>,
        upstream: Arc<dyn Upstream>,
        max_depth: i32,
    ) -> Self {
        Self {
            store,
            queue,
            upstream,
            max_depth,
        }
    }

    /// Dequeue and process a single job. `Ok(None)` means the queue was empty.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self.queue.dequeue(Utc::now()).await? else {
            return Ok(None);
        };
        let outcome = self.process_job(&job).await?;
        Ok(Some(outcome))
    }

    /// Process one claimed job. Upstream and store failures are absorbed into
    /// job state transitions; an `Err` here means the queue itself is broken.
    pub async fn process_job(&self, job: &CrawlJob) -> Result<JobOutcome> {
        info!(
            login = job.login.as_str(),
            depth = job.depth,
            priority = job.priority,
            attempt = job.attempts,
            "Crawling entity"
        );

        let profile = match self.upstream.fetch_profile(&job.login).await {
            Ok(profile) => profile,
            Err(err) => return self.absorb_upstream_error(job, err).await,
        };

        let store = &self.store;
        if let Err(err) = retry_write(|| store.upsert_entity_profile(&profile)).await {
            self.queue
                .fail(job, true, &format!("store write failed: {err}"), Utc::now())
                .await?;
            return Ok(JobOutcome::Failed);
        }

        self.collect_activity(&profile).await;

        let mut neighbors = 0usize;
        let mut new_jobs = 0usize;
        let mut private_count = 0i64;
        let mut min_tier_cents = None;

        for direction in [EdgeDirection::Sponsors, EdgeDirection::Sponsoring] {
            let mut cursor: Option<String> = None;
            loop {
                let page = match self
                    .upstream
                    .fetch_edges_page(&profile.login, direction, cursor.as_deref())
                    .await
                {
                    Ok(page) => page,
                    Err(err) => return self.absorb_upstream_error(job, err).await,
                };

                if direction == EdgeDirection::Sponsors {
                    private_count += page.private_count;
                    if min_tier_cents.is_none() {
                        min_tier_cents = page.min_tier_cents;
                    }
                }

                let now = Utc::now();
                for stub in &page.neighbors {
                    neighbors += 1;
                    if let Err(err) = self.record_neighbor(job, profile.github_id, stub, direction).await
                    {
                        self.queue
                            .fail(job, true, &format!("store write failed: {err}"), now)
                            .await?;
                        return Ok(JobOutcome::Failed);
                    }
                    let child_depth = job.depth + 1;
                    if child_depth <= self.max_depth {
                        let outcome = self
                            .queue
                            .enqueue_discovered(&stub.login, child_depth, now)
                            .await?;
                        if outcome.is_queued() {
                            new_jobs += 1;
                        }
                    }
                }

                cursor = page.next_cursor;
                if cursor.is_none() {
                    break;
                }
            }
        }

        let now = Utc::now();
        if let Err(err) = retry_write(|| {
            store.finalize_entity_scrape(profile.github_id, private_count, min_tier_cents, now)
        })
        .await
        {
            self.queue
                .fail(job, true, &format!("store write failed: {err}"), now)
                .await?;
            return Ok(JobOutcome::Failed);
        }

        let new_priority = adjusted_priority(job.priority, neighbors, private_count, new_jobs);
        self.queue
            .complete(job, profile.github_id, new_priority, now)
            .await?;

        info!(
            login = job.login.as_str(),
            github_id = profile.github_id,
            neighbors,
            new_jobs,
            private_count,
            new_priority,
            "Entity crawled"
        );
        Ok(JobOutcome::Completed { neighbors, new_jobs })
    }

    async fn record_neighbor(
        &self,
        job: &CrawlJob,
        source_id: i64,
        stub: &sponsorgraph_common::EntityStub,
        direction: EdgeDirection,
    ) -> Result<()> {
        debug!(
            login = job.login.as_str(),
            neighbor = stub.login.as_str(),
            direction = direction.as_str(),
            "Recording edge"
        );
        // Stub first: the edge insert requires both endpoints to exist.
        let store = &self.store;
        retry_write(|| store.upsert_entity_stub(stub)).await?;
        retry_write(|| store.upsert_edge(source_id, stub.github_id, direction, Utc::now())).await?;
        Ok(())
    }

    /// Refresh a user's yearly contribution totals, one year per call, from
    /// account creation to now. Skipped for organizations and while the
    /// existing rows are under a year old. Failures here never fail the job;
    /// the totals are filled in on a later crawl instead.
    async fn collect_activity(&self, profile: &Profile) {
        if profile.kind != EntityKind::User {
            return;
        }
        let Some(created_at) = profile.upstream_created_at else {
            return;
        };

        let now = Utc::now();
        match self.store.latest_activity_update(profile.github_id).await {
            Ok(Some(updated)) if now - updated < chrono::Duration::days(365) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(
                    login = profile.login.as_str(),
                    error = %err,
                    "Could not check activity freshness, skipping"
                );
                return;
            }
        }

        let mut collected = 0u32;
        for year in created_at.year()..=now.year() {
            let activity = match self.upstream.fetch_activity_year(&profile.login, year).await {
                Ok(activity) => activity,
                Err(UpstreamError::RateLimited { .. }) => {
                    debug!(
                        login = profile.login.as_str(),
                        year, "Rate limited during activity collection, stopping"
                    );
                    break;
                }
                Err(err) => {
                    warn!(
                        login = profile.login.as_str(),
                        year,
                        error = %err,
                        "Activity fetch failed, skipping year"
                    );
                    continue;
                }
            };
            let store = &self.store;
            if let Err(err) =
                retry_write(|| store.upsert_activity(profile.github_id, &activity, Utc::now()))
                    .await
            {
                warn!(
                    login = profile.login.as_str(),
                    year,
                    error = %err,
                    "Activity write failed, stopping"
                );
                break;
            }
            collected += 1;
        }
        if collected > 0 {
            debug!(
                login = profile.login.as_str(),
                years = collected,
                "Collected contribution activity"
            );
        }
    }

    /// Backfill pass for an idle queue: page the sponsorable-user search and
    /// enqueue anyone it finds at the lowest priority, so externally
    /// requested and discovered work always runs first. Returns the number
    /// of jobs actually queued.
    pub async fn seed_from_search(&self, max_pages: u32) -> Result<usize> {
        let mut queued = 0usize;
        let mut cursor: Option<String> = None;
        for _ in 0..max_pages {
            let page = match self.upstream.fetch_sponsorable_page(cursor.as_deref()).await {
                Ok(page) => page,
                Err(UpstreamError::RateLimited { .. }) => {
                    debug!("Rate limited during backfill search, stopping");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "Backfill search failed, stopping");
                    break;
                }
            };

            let now = Utc::now();
            for stub in &page.users {
                let store = &self.store;
                if let Err(err) = retry_write(|| store.upsert_entity_stub(stub)).await {
                    warn!(login = stub.login.as_str(), error = %err, "Backfill stub write failed");
                    continue;
                }
                if self
                    .queue
                    .enqueue_backfill(&stub.login, now)
                    .await?
                    .is_queued()
                {
                    queued += 1;
                }
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }
        if queued > 0 {
            info!(queued, "Backfilled sponsorable users into the queue");
        }
        Ok(queued)
    }

    /// Translate an upstream error into the job's next state.
    async fn absorb_upstream_error(
        &self,
        job: &CrawlJob,
        err: UpstreamError,
    ) -> Result<JobOutcome> {
        let now = Utc::now();
        match err {
            UpstreamError::NotFound => {
                info!(login = job.login.as_str(), "Entity gone upstream, tombstoning");
                self.store.tombstone_entity(&job.login).await?;
                self.queue
                    .fail(job, false, "entity not found upstream", now)
                    .await?;
                Ok(JobOutcome::Tombstoned)
            }
            UpstreamError::RateLimited { reset_at } => {
                let until = reset_at.unwrap_or(now + chrono::Duration::seconds(60));
                self.queue.defer(job, until, now).await?;
                Ok(JobOutcome::Deferred)
            }
            UpstreamError::Transient(msg) => {
                self.queue.fail(job, true, &msg, now).await?;
                Ok(JobOutcome::Failed)
            }
        }
    }
}

/// One immediate retry per individual store write. A single connection blip
/// should cost a statement, not the whole job's progress.
async fn retry_write<T, Fut, F>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(err) => {
            debug!(error = %err, "Store write failed, retrying once");
            op().await
        }
    }
}

/// Priority adaptation: entities that keep yielding new parts of the graph
/// drift up; dead ends drift down. Clamped to [MIN_PRIORITY, MAX_PRIORITY].
fn adjusted_priority(current: i32, neighbors: usize, private_count: i64, new_jobs: usize) -> i32 {
    if new_jobs > 0 {
        (current + 1).min(MAX_PRIORITY)
    } else if neighbors > 0 || private_count > 0 {
        current
    } else {
        (current - 1).max(MIN_PRIORITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuePolicy;
    use crate::testing::{test_page, test_profile, MemoryStore, ScriptedUpstream};
    use chrono::{DateTime, Utc};
    use sponsorgraph_common::{ActivityYear, EnqueueOutcome, JobState};

    struct Fixture {
        store: Arc<MemoryStore>,
        queue: Arc<JobQueue>,
        upstream: Arc<ScriptedUpstream>,
        worker: CrawlWorker,
    }

    fn fixture_with(policy: QueuePolicy, max_depth: i32) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(JobQueue::new(store.clone(), policy));
        let upstream = Arc::new(ScriptedUpstream::new());
        let worker = CrawlWorker::new(
            store.clone(),
            queue.clone(),
            upstream.clone(),
            max_depth,
        );
        Fixture {
            store,
            queue,
            upstream,
            worker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(QueuePolicy::default(), 3)
    }

    async fn seed_and_claim(f: &Fixture, login: &str) -> CrawlJob {
        f.queue.enqueue_seed(login, Utc::now()).await.unwrap();
        f.queue.dequeue(Utc::now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn crawls_seed_and_discovers_neighbors() {
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsors,
            vec![test_page(&[(2, "alice"), (3, "bob")])],
        );
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsoring,
            vec![test_page(&[(4, "carol")])],
        );

        let job = seed_and_claim(&f, "octocat").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Completed {
                neighbors: 3,
                new_jobs: 3
            }
        );

        // 3 edges, correctly directed from the crawled entity.
        assert_eq!(
            f.store.edge_keys(),
            vec![
                (1, 2, EdgeDirection::Sponsors),
                (1, 3, EdgeDirection::Sponsors),
                (1, 4, EdgeDirection::Sponsoring),
            ]
        );

        // 3 new depth-1 jobs.
        for login in ["alice", "bob", "carol"] {
            let job = f.queue.job_by_login(login).await.unwrap().unwrap();
            assert_eq!(job.state, JobState::Pending);
            assert_eq!(job.depth, 1);
        }

        // Seed marked done, entity enriched and finalized.
        let seed = f.queue.job_by_login("octocat").await.unwrap().unwrap();
        assert_eq!(seed.state, JobState::Done);
        assert_eq!(seed.github_id, Some(1));
        let entity = f.store.get_entity(1).await.unwrap().unwrap();
        assert!(entity.is_enriched);
        assert!(entity.last_scraped.is_some());
    }

    #[tokio::test]
    async fn missing_entity_is_tombstoned_without_neighbors() {
        let f = fixture();
        // Stub exists from an earlier discovery.
        f.store
            .upsert_entity_stub(&sponsorgraph_common::EntityStub {
                github_id: 9,
                login: "ghost-user".into(),
                kind: sponsorgraph_common::EntityKind::User,
            })
            .await
            .unwrap();

        let job = seed_and_claim(&f, "ghost-user").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Tombstoned);
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(f.store.get_entity(9).await.unwrap().unwrap().tombstoned);
        // Only the seed job exists — nothing was enqueued.
        assert_eq!(f.store.job_count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_reschedule_with_backoff() {
        let f = fixture();
        f.upstream
            .push_profile_error("flaky", UpstreamError::Transient("503".into()));

        let job = seed_and_claim(&f, "flaky").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Failed);
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert!(stored.next_eligible_at > Utc::now());
        assert_eq!(stored.last_error.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn retry_ceiling_makes_failure_terminal() {
        let f = fixture();
        for _ in 0..3 {
            f.upstream
                .push_profile_error("flaky", UpstreamError::Transient("503".into()));
        }
        f.queue.enqueue_seed("flaky", Utc::now()).await.unwrap();

        let mut when = Utc::now();
        for _ in 0..3 {
            let job = f.queue.dequeue(when).await.unwrap().unwrap();
            f.worker.process_job(&job).await.unwrap();
            when += chrono::Duration::hours(1);
        }

        let stored = f.queue.job_by_login("flaky").await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn rate_limit_defers_job_to_reset_time() {
        let f = fixture();
        let reset: DateTime<Utc> = Utc::now() + chrono::Duration::minutes(42);
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.upstream.push_edges_error(
            "octocat",
            EdgeDirection::Sponsors,
            UpstreamError::RateLimited {
                reset_at: Some(reset),
            },
        );

        let job = seed_and_claim(&f, "octocat").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Deferred);
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.next_eligible_at, reset);
        // Deferral gave the attempt back.
        assert_eq!(stored.attempts, 0);
    }

    #[tokio::test]
    async fn recrawl_is_idempotent() {
        // Freshness of zero: done jobs are immediately re-enqueueable.
        let policy = QueuePolicy {
            freshness: chrono::Duration::zero(),
            ..QueuePolicy::default()
        };
        let f = fixture_with(policy, 3);
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsors,
            vec![test_page(&[(2, "alice")])],
        );

        let job = seed_and_claim(&f, "octocat").await;
        f.worker.process_job(&job).await.unwrap();
        let first_scraped = f
            .store
            .get_entity(1)
            .await
            .unwrap()
            .unwrap()
            .last_scraped
            .unwrap();
        let first_seen = f
            .store
            .edge(1, 2, EdgeDirection::Sponsors)
            .unwrap()
            .first_seen;

        // Crawl again with identical upstream state.
        let again = f
            .queue
            .enqueue_seed("octocat", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(matches!(again, EnqueueOutcome::Queued { .. }));
        let job = f
            .queue
            .dequeue(Utc::now() + chrono::Duration::seconds(2))
            .await
            .unwrap()
            .unwrap();
        f.worker.process_job(&job).await.unwrap();

        // No duplicate edges; first_seen preserved, last_scraped refreshed.
        assert_eq!(f.store.edge_keys().len(), 1);
        let edge = f.store.edge(1, 2, EdgeDirection::Sponsors).unwrap();
        assert_eq!(edge.first_seen, first_seen);
        assert!(edge.last_seen >= first_seen);
        let entity = f.store.get_entity(1).await.unwrap().unwrap();
        assert!(entity.last_scraped.unwrap() >= first_scraped);
    }

    #[tokio::test]
    async fn max_depth_cuts_off_discovery() {
        let f = fixture_with(QueuePolicy::default(), 1);
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.upstream.set_profile(test_profile(2, "alice"));
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsors,
            vec![test_page(&[(2, "alice")])],
        );
        f.upstream.set_pages(
            "alice",
            EdgeDirection::Sponsors,
            vec![test_page(&[(5, "eve")])],
        );

        // Depth 0 → 1 is allowed.
        let job = seed_and_claim(&f, "octocat").await;
        f.worker.process_job(&job).await.unwrap();
        assert!(f.queue.job_by_login("alice").await.unwrap().is_some());

        // Depth 1 → 2 exceeds max_depth 1: edge recorded, no job enqueued.
        let job = f.queue.dequeue(Utc::now()).await.unwrap().unwrap();
        assert_eq!(job.login, "alice");
        let outcome = f.worker.process_job(&job).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                neighbors: 1,
                new_jobs: 0
            }
        );
        assert!(f.store.edge(2, 5, EdgeDirection::Sponsors).is_some());
        assert!(f.queue.job_by_login("eve").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paginates_all_pages_in_both_directions() {
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsors,
            vec![
                test_page(&[(2, "alice"), (3, "bob")]),
                test_page(&[(4, "carol")]),
            ],
        );
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsoring,
            vec![test_page(&[(5, "dan")])],
        );

        let job = seed_and_claim(&f, "octocat").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Completed {
                neighbors: 4,
                new_jobs: 4
            }
        );
        // 1 profile call + 2 sponsor pages + 1 sponsoring page.
        assert_eq!(f.upstream.profile_calls(), 1);
        assert_eq!(f.upstream.edge_calls(), 3);
    }

    #[tokio::test]
    async fn priority_adapts_to_discovery_yield() {
        // No relations at all: priority decays.
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "loner"));
        let job = seed_and_claim(&f, "loner").await;
        f.worker.process_job(&job).await.unwrap();
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.priority, job.priority - 1);

        // New discoveries: priority rises (clamped at the cap).
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "hub"));
        f.upstream.set_pages(
            "hub",
            EdgeDirection::Sponsors,
            vec![test_page(&[(2, "alice")])],
        );
        let job = seed_and_claim(&f, "hub").await;
        f.worker.process_job(&job).await.unwrap();
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.priority, MAX_PRIORITY);
    }

    #[tokio::test]
    async fn private_sponsors_counted_and_tier_recorded() {
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "octocat"));
        let mut page = test_page(&[(2, "alice")]);
        page.private_count = 4;
        page.min_tier_cents = Some(500);
        f.upstream
            .set_pages("octocat", EdgeDirection::Sponsors, vec![page]);

        let job = seed_and_claim(&f, "octocat").await;
        f.worker.process_job(&job).await.unwrap();

        let entity = f.store.get_entity(1).await.unwrap().unwrap();
        assert_eq!(entity.private_sponsor_count, 4);
        assert_eq!(entity.min_tier_cents, Some(500));
    }

    #[tokio::test]
    async fn store_write_failure_is_retryable() {
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.store.fail_entity_writes(u32::MAX);

        let job = seed_and_claim(&f, "octocat").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(outcome, JobOutcome::Failed);
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
    }

    #[tokio::test]
    async fn single_store_write_blip_does_not_fail_the_job() {
        let f = fixture();
        f.upstream.set_profile(test_profile(1, "octocat"));
        f.upstream.set_pages(
            "octocat",
            EdgeDirection::Sponsors,
            vec![test_page(&[(2, "alice")])],
        );
        // Exactly one write fails; the statement-level retry absorbs it.
        f.store.fail_entity_writes(1);

        let job = seed_and_claim(&f, "octocat").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Completed {
                neighbors: 1,
                new_jobs: 1
            }
        );
        assert!(f.store.get_entity(1).await.unwrap().unwrap().is_enriched);
        assert!(f.store.edge(1, 2, EdgeDirection::Sponsors).is_some());
    }

    #[tokio::test]
    async fn collects_yearly_activity_for_users() {
        let f = fixture();
        let mut profile = test_profile(1, "octocat");
        let created = Utc::now() - chrono::Duration::days(365 * 2 + 30);
        profile.upstream_created_at = Some(created);
        f.upstream.set_profile(profile);
        let this_year = Utc::now().year();
        f.upstream.set_activity(
            "octocat",
            ActivityYear {
                year: this_year,
                commits: 42,
                pull_requests: 7,
                issues: 1,
                reviews: 3,
            },
        );

        let job = seed_and_claim(&f, "octocat").await;
        f.worker.process_job(&job).await.unwrap();

        // One row per year since account creation; unscripted years are zero.
        let years = f.store.activity_years(1);
        assert_eq!(years.len(), (this_year - created.year() + 1) as usize);
        assert_eq!(years[0].year, created.year());
        assert_eq!(years[0].commits, 0);
        let latest = years.last().unwrap();
        assert_eq!(latest.year, this_year);
        assert_eq!(latest.commits, 42);
    }

    #[tokio::test]
    async fn organizations_get_no_activity() {
        let f = fixture();
        let mut profile = test_profile(1, "acme");
        profile.kind = sponsorgraph_common::EntityKind::Organization;
        profile.upstream_created_at = Some(Utc::now() - chrono::Duration::days(400));
        f.upstream.set_profile(profile);

        let job = seed_and_claim(&f, "acme").await;
        f.worker.process_job(&job).await.unwrap();

        assert_eq!(f.upstream.activity_calls(), 0);
        assert!(f.store.activity_years(1).is_empty());
    }

    #[tokio::test]
    async fn fresh_activity_is_not_refetched() {
        let policy = QueuePolicy {
            freshness: chrono::Duration::zero(),
            ..QueuePolicy::default()
        };
        let f = fixture_with(policy, 3);
        let mut profile = test_profile(1, "octocat");
        profile.upstream_created_at = Some(Utc::now() - chrono::Duration::days(30));
        f.upstream.set_profile(profile);

        let job = seed_and_claim(&f, "octocat").await;
        f.worker.process_job(&job).await.unwrap();
        let calls_after_first = f.upstream.activity_calls();
        assert!(calls_after_first > 0);

        // Re-crawl right away: the year-old refresh window skips the fetch.
        f.queue
            .enqueue_seed("octocat", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        let job = f
            .queue
            .dequeue(Utc::now() + chrono::Duration::seconds(2))
            .await
            .unwrap()
            .unwrap();
        f.worker.process_job(&job).await.unwrap();

        assert_eq!(f.upstream.activity_calls(), calls_after_first);
    }

    #[tokio::test]
    async fn activity_failures_do_not_fail_the_job() {
        let f = fixture();
        let mut profile = test_profile(1, "octocat");
        profile.upstream_created_at = Some(Utc::now() - chrono::Duration::days(30));
        f.upstream.set_profile(profile);
        f.upstream
            .push_activity_error("octocat", UpstreamError::Transient("503".into()));

        let job = seed_and_claim(&f, "octocat").await;
        let outcome = f.worker.process_job(&job).await.unwrap();

        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        let stored = f.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Done);
    }

    #[tokio::test]
    async fn backfill_seeds_search_results_at_lowest_priority() {
        let f = fixture();
        f.upstream.set_sponsorable_pages(vec![
            vec![
                sponsorgraph_common::EntityStub {
                    github_id: 10,
                    login: "newcomer".into(),
                    kind: sponsorgraph_common::EntityKind::User,
                },
                sponsorgraph_common::EntityStub {
                    github_id: 11,
                    login: "veteran".into(),
                    kind: sponsorgraph_common::EntityKind::User,
                },
            ],
            vec![sponsorgraph_common::EntityStub {
                github_id: 12,
                login: "straggler".into(),
                kind: sponsorgraph_common::EntityKind::User,
            }],
        ]);
        // Already tracked: the backfill must not reopen it.
        f.queue.enqueue_seed("veteran", Utc::now()).await.unwrap();

        let queued = f.worker.seed_from_search(10).await.unwrap();

        assert_eq!(queued, 2);
        assert_eq!(f.upstream.sponsorable_calls(), 2);
        let job = f.queue.job_by_login("newcomer").await.unwrap().unwrap();
        assert_eq!(job.depth, 0);
        assert_eq!(job.priority, sponsorgraph_common::BACKFILL_PRIORITY);
        // Stub rows exist for everyone found.
        assert!(f.store.get_entity(12).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn backfill_respects_page_cap() {
        let f = fixture();
        f.upstream.set_sponsorable_pages(vec![
            vec![sponsorgraph_common::EntityStub {
                github_id: 10,
                login: "page-one".into(),
                kind: sponsorgraph_common::EntityKind::User,
            }],
            vec![sponsorgraph_common::EntityStub {
                github_id: 11,
                login: "page-two".into(),
                kind: sponsorgraph_common::EntityKind::User,
            }],
        ]);

        let queued = f.worker.seed_from_search(1).await.unwrap();

        assert_eq!(queued, 1);
        assert_eq!(f.upstream.sponsorable_calls(), 1);
        assert!(f.queue.job_by_login("page-two").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_once_reports_empty_queue() {
        let f = fixture();
        assert_eq!(f.worker.run_once().await.unwrap(), None);
    }
}
