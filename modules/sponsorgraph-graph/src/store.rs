//! Postgres store for the sponsorship graph and the crawl queue.
//!
//! The crawler owns every write in here; the intake/dashboard layer only
//! reads. Each statement is a single atomic upsert, so readers never observe
//! partial entity states.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use sponsorgraph_common::{
    ActivityYear, CrawlJob, EdgeDirection, EnqueueOutcome, Entity, EntityKind, EntityStub,
    JobState, Profile,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    login: String,
    github_id: Option<i64>,
    depth: i32,
    priority: i32,
    state: String,
    attempts: i32,
    next_eligible_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl JobRow {
    fn into_job(self) -> anyhow::Result<CrawlJob> {
        let state = JobState::parse(&self.state)
            .ok_or_else(|| anyhow::anyhow!("unknown job state in database: {}", self.state))?;
        Ok(CrawlJob {
            id: self.id,
            login: self.login,
            github_id: self.github_id,
            depth: self.depth,
            priority: self.priority,
            state,
            attempts: self.attempts,
            next_eligible_at: self.next_eligible_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_error: self.last_error,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    github_id: i64,
    login: String,
    kind: String,
    name: Option<String>,
    location: Option<String>,
    company: Option<String>,
    bio: Option<String>,
    followers: i64,
    following: i64,
    public_repos: i64,
    avatar_url: Option<String>,
    profile_url: Option<String>,
    upstream_created_at: Option<DateTime<Utc>>,
    private_sponsor_count: i64,
    min_tier_cents: Option<i64>,
    last_scraped: Option<DateTime<Utc>>,
    is_enriched: bool,
    tombstoned: bool,
}

impl EntityRow {
    fn into_entity(self) -> anyhow::Result<Entity> {
        let kind = EntityKind::parse(&self.kind)
            .ok_or_else(|| anyhow::anyhow!("unknown entity kind in database: {}", self.kind))?;
        Ok(Entity {
            github_id: self.github_id,
            login: self.login,
            kind,
            name: self.name,
            location: self.location,
            company: self.company,
            bio: self.bio,
            followers: self.followers,
            following: self.following,
            public_repos: self.public_repos,
            avatar_url: self.avatar_url,
            profile_url: self.profile_url,
            upstream_created_at: self.upstream_created_at,
            private_sponsor_count: self.private_sponsor_count,
            min_tier_cents: self.min_tier_cents,
            last_scraped: self.last_scraped,
            is_enriched: self.is_enriched,
            tombstoned: self.tombstoned,
        })
    }
}

const JOB_COLUMNS: &str = "id, login, github_id, depth, priority, state, attempts, \
     next_eligible_at, created_at, updated_at, last_error";

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // --- Entities ---

    /// Create a stub row for a newly discovered neighbor. Keeps any existing
    /// data (the entity may already be enriched).
    pub async fn upsert_entity_stub(&self, stub: &EntityStub) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (github_id, login, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (github_id) DO NOTHING
            "#,
        )
        .bind(stub.github_id)
        .bind(&stub.login)
        .bind(stub.kind.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert the full profile for an entity. Marks it enriched and clears
    /// any tombstone (the account is demonstrably alive).
    pub async fn upsert_entity_profile(&self, profile: &Profile) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (
                github_id, login, kind, name, location, company, bio,
                followers, following, public_repos, avatar_url, profile_url,
                upstream_created_at, is_enriched, tombstoned
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, TRUE, FALSE)
            ON CONFLICT (github_id) DO UPDATE SET
                login = EXCLUDED.login,
                kind = EXCLUDED.kind,
                name = EXCLUDED.name,
                location = EXCLUDED.location,
                company = EXCLUDED.company,
                bio = EXCLUDED.bio,
                followers = EXCLUDED.followers,
                following = EXCLUDED.following,
                public_repos = EXCLUDED.public_repos,
                avatar_url = EXCLUDED.avatar_url,
                profile_url = EXCLUDED.profile_url,
                upstream_created_at = EXCLUDED.upstream_created_at,
                is_enriched = TRUE,
                tombstoned = FALSE
            "#,
        )
        .bind(profile.github_id)
        .bind(&profile.login)
        .bind(profile.kind.as_str())
        .bind(&profile.name)
        .bind(&profile.location)
        .bind(&profile.company)
        .bind(&profile.bio)
        .bind(profile.followers)
        .bind(profile.following)
        .bind(profile.public_repos)
        .bind(&profile.avatar_url)
        .bind(&profile.profile_url)
        .bind(profile.upstream_created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record the end of a successful crawl: sponsorship listing metadata and
    /// the `last_scraped` watermark the freshness window keys off.
    pub async fn finalize_entity_scrape(
        &self,
        github_id: i64,
        private_sponsor_count: i64,
        min_tier_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE entities SET
                private_sponsor_count = $2,
                min_tier_cents = $3,
                last_scraped = $4
            WHERE github_id = $1
            "#,
        )
        .bind(github_id)
        .bind(private_sponsor_count)
        .bind(min_tier_cents)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark every entity row with this login as tombstoned (deleted/renamed
    /// upstream). A login that was never persisted is a no-op.
    pub async fn tombstone_entity(&self, login: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE entities SET tombstoned = TRUE WHERE login = $1")
            .bind(login)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_entity(&self, github_id: i64) -> anyhow::Result<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>("SELECT * FROM entities WHERE github_id = $1")
            .bind(github_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(EntityRow::into_entity).transpose()
    }

    // --- Activity ---

    /// Upsert one calendar year of contribution totals for a user.
    pub async fn upsert_activity(
        &self,
        github_id: i64,
        activity: &ActivityYear,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entity_activity
                (github_id, year, commits, pull_requests, issues, reviews, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (github_id, year) DO UPDATE SET
                commits = EXCLUDED.commits,
                pull_requests = EXCLUDED.pull_requests,
                issues = EXCLUDED.issues,
                reviews = EXCLUDED.reviews,
                last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(github_id)
        .bind(activity.year)
        .bind(activity.commits)
        .bind(activity.pull_requests)
        .bind(activity.issues)
        .bind(activity.reviews)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Newest `last_updated` across an entity's activity rows. `None` means
    /// activity has never been collected for this entity.
    pub async fn latest_activity_update(
        &self,
        github_id: i64,
    ) -> anyhow::Result<Option<DateTime<Utc>>> {
        let (latest,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MAX(last_updated) FROM entity_activity WHERE github_id = $1",
        )
        .bind(github_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(latest)
    }

    // --- Edges ---

    /// Idempotent edge insert keyed by (source, target, direction).
    /// Re-observing an edge only refreshes `last_seen`.
    pub async fn upsert_edge(
        &self,
        source_id: i64,
        target_id: i64,
        direction: EdgeDirection,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO edges (source_id, target_id, direction, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $4)
            ON CONFLICT (source_id, target_id, direction)
            DO UPDATE SET last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(source_id)
        .bind(target_id)
        .bind(direction.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Crawl jobs ---

    /// Enqueue a crawl for `login`, deduplicated by login.
    ///
    /// No-op (`Duplicate`) when a job is already pending/in progress, or done
    /// with an update newer than `freshness_cutoff`. A failed job, or a done
    /// job older than the cutoff, is flipped back to pending — keeping its
    /// id, taking the shallower depth and the higher priority.
    pub async fn enqueue_job(
        &self,
        login: &str,
        depth: i32,
        priority: i32,
        freshness_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<EnqueueOutcome> {
        let inserted = sqlx::query_as::<_, (Uuid,)>(
            r#"
            INSERT INTO crawl_jobs
                (id, login, depth, priority, state, attempts, next_eligible_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, $5, $5, $5)
            ON CONFLICT (login) DO UPDATE SET
                state = 'pending',
                depth = LEAST(crawl_jobs.depth, EXCLUDED.depth),
                priority = GREATEST(crawl_jobs.priority, EXCLUDED.priority),
                attempts = 0,
                next_eligible_at = EXCLUDED.next_eligible_at,
                updated_at = EXCLUDED.updated_at,
                last_error = NULL
            WHERE crawl_jobs.state = 'failed'
               OR (crawl_jobs.state = 'done' AND crawl_jobs.updated_at < $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(login)
        .bind(depth)
        .bind(priority)
        .bind(now)
        .bind(freshness_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((job_id,)) = inserted {
            return Ok(EnqueueOutcome::Queued { job_id });
        }

        // Conflict with a live or fresh job — the dedup no-op.
        let (job_id,) = sqlx::query_as::<_, (Uuid,)>("SELECT id FROM crawl_jobs WHERE login = $1")
            .bind(login)
            .fetch_one(&self.pool)
            .await?;
        Ok(EnqueueOutcome::Duplicate { job_id })
    }

    /// Claim the next eligible pending job: lowest depth, then highest
    /// priority, then FIFO. The claim flips it to in_progress and bumps
    /// `attempts` in one statement — the queue's single serialization point.
    pub async fn dequeue_job(&self, now: DateTime<Utc>) -> anyhow::Result<Option<CrawlJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE crawl_jobs SET
                state = 'in_progress',
                attempts = attempts + 1,
                updated_at = $1
            WHERE id = (
                SELECT id FROM crawl_jobs
                WHERE state = 'pending' AND next_eligible_at <= $1
                ORDER BY depth ASC, priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    pub async fn complete_job(
        &self,
        id: Uuid,
        github_id: i64,
        new_priority: i32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                state = 'done',
                github_id = $2,
                priority = $3,
                updated_at = $4,
                last_error = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(github_id)
        .bind(new_priority)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put a retryable failure back in the pending pool with a backoff delay.
    pub async fn reschedule_job(
        &self,
        id: Uuid,
        next_eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                state = 'pending',
                next_eligible_at = $2,
                last_error = $3,
                updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_eligible_at)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rate-limit deferral: back to pending at the budget reset time. Gives
    /// back the attempt consumed by the claim — a deferral is scheduling,
    /// not a failure.
    pub async fn defer_job(
        &self,
        id: Uuid,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                state = 'pending',
                attempts = GREATEST(attempts - 1, 0),
                next_eligible_at = $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(until)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal failure — NotFound upstream or retry ceiling exceeded.
    pub async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                state = 'failed',
                last_error = $2,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: Uuid) -> anyhow::Result<Option<CrawlJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    pub async fn get_job_by_login(&self, login: &str) -> anyhow::Result<Option<CrawlJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs WHERE login = $1"
        ))
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRow::into_job).transpose()
    }

    /// Recent jobs for the intake API's queue listing.
    pub async fn list_jobs(&self, limit: i64) -> anyhow::Result<Vec<CrawlJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM crawl_jobs ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    /// Re-open done jobs whose entity has gone stale. Resets `created_at` so
    /// re-crawls queue behind current work at the same depth/priority tier.
    pub async fn requeue_stale(
        &self,
        last_scraped_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                state = 'pending',
                attempts = 0,
                next_eligible_at = $2,
                created_at = $2,
                updated_at = $2
            FROM entities
            WHERE crawl_jobs.github_id = entities.github_id
              AND crawl_jobs.state = 'done'
              AND entities.tombstoned = FALSE
              AND entities.last_scraped < $1
            "#,
        )
        .bind(last_scraped_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Release jobs stranded in `in_progress` by a crashed worker. A claim
    /// that has not been touched since `updated_before` is assumed dead and
    /// flipped back to pending.
    pub async fn reclaim_abandoned(
        &self,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_jobs SET
                state = 'pending',
                next_eligible_at = $2,
                updated_at = $2
            WHERE state = 'in_progress'
              AND updated_at < $1
            "#,
        )
        .bind(updated_before)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Jobs still awaiting work (pending or claimed). Zero means the queue
    /// has fully drained.
    pub async fn count_unfinished_jobs(&self) -> anyhow::Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM crawl_jobs WHERE state IN ('pending', 'in_progress')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
