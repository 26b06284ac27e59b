// Trait abstractions for the crawl loop's dependencies.
//
// GraphStore — every persistent write/read the crawler performs, one seam.
// Upstream — profile + edge-page fetches with retry/budget policy applied.
//
// These enable deterministic testing with MemoryStore and ScriptedUpstream:
// no network, no database, no Docker.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use github_client::{EdgePage, SponsorablePage};
use sponsorgraph_common::{
    ActivityYear, CrawlJob, EdgeDirection, EnqueueOutcome, Entity, EntityStub, Profile,
};
use sponsorgraph_graph::PgStore;

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GraphStore: Send + Sync {
    // --- Entities ---

    /// Create a minimal row for a newly discovered neighbor; keeps existing data.
    async fn upsert_entity_stub(&self, stub: &EntityStub) -> Result<()>;

    /// Full profile upsert; marks the entity enriched, clears any tombstone.
    async fn upsert_entity_profile(&self, profile: &Profile) -> Result<()>;

    /// Record sponsorship-listing metadata and the `last_scraped` watermark.
    async fn finalize_entity_scrape(
        &self,
        github_id: i64,
        private_sponsor_count: i64,
        min_tier_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Mark an upstream-deleted login's entity as tombstoned.
    async fn tombstone_entity(&self, login: &str) -> Result<()>;

    async fn get_entity(&self, github_id: i64) -> Result<Option<Entity>>;

    // --- Activity ---

    /// Upsert one calendar year of a user's contribution totals.
    async fn upsert_activity(
        &self,
        github_id: i64,
        activity: &ActivityYear,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Newest activity write for an entity; `None` when never collected.
    async fn latest_activity_update(&self, github_id: i64) -> Result<Option<DateTime<Utc>>>;

    // --- Edges ---

    /// Idempotent insert keyed by (source, target, direction).
    async fn upsert_edge(
        &self,
        source_id: i64,
        target_id: i64,
        direction: EdgeDirection,
        now: DateTime<Utc>,
    ) -> Result<()>;

    // --- Crawl jobs ---

    /// Login-deduplicated enqueue. See [`sponsorgraph_graph::PgStore::enqueue_job`].
    async fn enqueue_job(
        &self,
        login: &str,
        depth: i32,
        priority: i32,
        freshness_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome>;

    /// Claim the next eligible pending job (lowest depth, highest priority,
    /// FIFO), flipping it to in_progress and bumping its attempt count.
    async fn dequeue_job(&self, now: DateTime<Utc>) -> Result<Option<CrawlJob>>;

    async fn complete_job(
        &self,
        id: Uuid,
        github_id: i64,
        new_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Retryable failure: back to pending with a backoff delay.
    async fn reschedule_job(
        &self,
        id: Uuid,
        next_eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Rate-limit deferral: pending again at the reset time, attempt given back.
    async fn defer_job(&self, id: Uuid, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()>;

    /// Terminal failure.
    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<CrawlJob>>;

    async fn get_job_by_login(&self, login: &str) -> Result<Option<CrawlJob>>;

    async fn list_jobs(&self, limit: i64) -> Result<Vec<CrawlJob>>;

    /// Re-open done jobs whose entity's `last_scraped` predates the cutoff.
    async fn requeue_stale(
        &self,
        last_scraped_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Release in_progress jobs untouched since `updated_before` back to
    /// pending. Recovers claims lost to a crashed worker.
    async fn reclaim_abandoned(
        &self,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Pending + in_progress job count; zero means the queue has drained.
    async fn count_unfinished_jobs(&self) -> Result<i64>;
}

#[async_trait]
impl GraphStore for PgStore {
    async fn upsert_entity_stub(&self, stub: &EntityStub) -> Result<()> {
        PgStore::upsert_entity_stub(self, stub).await
    }

    async fn upsert_entity_profile(&self, profile: &Profile) -> Result<()> {
        PgStore::upsert_entity_profile(self, profile).await
    }

    async fn finalize_entity_scrape(
        &self,
        github_id: i64,
        private_sponsor_count: i64,
        min_tier_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        PgStore::finalize_entity_scrape(self, github_id, private_sponsor_count, min_tier_cents, now)
            .await
    }

    async fn tombstone_entity(&self, login: &str) -> Result<()> {
        PgStore::tombstone_entity(self, login).await
    }

    async fn get_entity(&self, github_id: i64) -> Result<Option<Entity>> {
        PgStore::get_entity(self, github_id).await
    }

    async fn upsert_activity(
        &self,
        github_id: i64,
        activity: &ActivityYear,
        now: DateTime<Utc>,
    ) -> Result<()> {
        PgStore::upsert_activity(self, github_id, activity, now).await
    }

    async fn latest_activity_update(&self, github_id: i64) -> Result<Option<DateTime<Utc>>> {
        PgStore::latest_activity_update(self, github_id).await
    }

    async fn upsert_edge(
        &self,
        source_id: i64,
        target_id: i64,
        direction: EdgeDirection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        PgStore::upsert_edge(self, source_id, target_id, direction, now).await
    }

    async fn enqueue_job(
        &self,
        login: &str,
        depth: i32,
        priority: i32,
        freshness_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        PgStore::enqueue_job(self, login, depth, priority, freshness_cutoff, now).await
    }

    async fn dequeue_job(&self, now: DateTime<Utc>) -> Result<Option<CrawlJob>> {
        PgStore::dequeue_job(self, now).await
    }

    async fn complete_job(
        &self,
        id: Uuid,
        github_id: i64,
        new_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        PgStore::complete_job(self, id, github_id, new_priority, now).await
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        next_eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        PgStore::reschedule_job(self, id, next_eligible_at, error, now).await
    }

    async fn defer_job(&self, id: Uuid, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        PgStore::defer_job(self, id, until, now).await
    }

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        PgStore::fail_job(self, id, error, now).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        PgStore::get_job(self, id).await
    }

    async fn get_job_by_login(&self, login: &str) -> Result<Option<CrawlJob>> {
        PgStore::get_job_by_login(self, login).await
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<CrawlJob>> {
        PgStore::list_jobs(self, limit).await
    }

    async fn requeue_stale(
        &self,
        last_scraped_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        PgStore::requeue_stale(self, last_scraped_before, now).await
    }

    async fn reclaim_abandoned(
        &self,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        PgStore::reclaim_abandoned(self, updated_before, now).await
    }

    async fn count_unfinished_jobs(&self) -> Result<i64> {
        PgStore::count_unfinished_jobs(self).await
    }
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

/// Error surface of the upstream provider, after the production impl has
/// already applied its transient-retry policy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Account deleted or renamed. Terminal for the job, never retried.
    #[error("entity not found upstream")]
    NotFound,

    /// Call budget exhausted. A scheduling deferral, not a job failure.
    #[error("rate limited until {reset_at:?}")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// Network failure, 5xx, or malformed payload — retry ceiling exceeded.
    #[error("transient upstream failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Upstream: Send + Sync {
    /// Fetch an entity's profile by login.
    async fn fetch_profile(&self, login: &str) -> Result<Profile, UpstreamError>;

    /// Fetch one page of sponsorship edges. `cursor: None` is the first page.
    async fn fetch_edges_page(
        &self,
        login: &str,
        direction: EdgeDirection,
        cursor: Option<&str>,
    ) -> Result<EdgePage, UpstreamError>;

    /// Fetch one calendar year of a user's contribution totals.
    async fn fetch_activity_year(
        &self,
        login: &str,
        year: i32,
    ) -> Result<ActivityYear, UpstreamError>;

    /// Fetch one page of the sponsorable-user search used to backfill the queue.
    async fn fetch_sponsorable_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<SponsorablePage, UpstreamError>;
}
