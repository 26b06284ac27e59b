//! In-memory fakes for deterministic tests: a full [`GraphStore`] with the
//! same transition semantics as the Postgres store, and a scriptable
//! [`Upstream`] that replays canned profiles, edge pages, and failures.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use github_client::{EdgePage, SponsorablePage};
use sponsorgraph_common::{
    ActivityYear, CrawlJob, EdgeDirection, EnqueueOutcome, Entity, EntityKind, EntityStub,
    JobState, Profile,
};

use crate::traits::{GraphStore, Upstream, UpstreamError};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredEdge {
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Default)]
struct StoreInner {
    entities: HashMap<i64, Entity>,
    edges: HashMap<(i64, i64, EdgeDirection), StoredEdge>,
    activity: HashMap<(i64, i32), (ActivityYear, DateTime<Utc>)>,
    jobs: HashMap<Uuid, CrawlJob>,
    /// Monotonic insertion order per job, so same-timestamp enqueues
    /// dequeue FIFO like the Pg store's `ORDER BY created_at`.
    job_seq: HashMap<Uuid, u64>,
    next_seq: u64,
    by_login: HashMap<String, Uuid>,
    /// Remaining entity/edge writes to reject. `u32::MAX` means always fail.
    fail_entity_writes: u32,
}

impl StoreInner {
    fn take_write_failure(&mut self) -> Result<()> {
        if self.fail_entity_writes == 0 {
            return Ok(());
        }
        if self.fail_entity_writes != u32::MAX {
            self.fail_entity_writes -= 1;
        }
        Err(anyhow!("simulated store write failure"))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `count` entity/edge writes (`u32::MAX` for always),
    /// to exercise the store-write failure and retry paths.
    pub fn fail_entity_writes(&self, count: u32) {
        self.inner.lock().unwrap().fail_entity_writes = count;
    }

    /// All activity rows stored for an entity, ordered by year.
    pub fn activity_years(&self, github_id: i64) -> Vec<ActivityYear> {
        let inner = self.inner.lock().unwrap();
        let mut years: Vec<_> = inner
            .activity
            .iter()
            .filter(|((id, _), _)| *id == github_id)
            .map(|(_, (activity, _))| *activity)
            .collect();
        years.sort_by_key(|a| a.year);
        years
    }

    pub fn entity_by_login(&self, login: &str) -> Option<Entity> {
        let inner = self.inner.lock().unwrap();
        inner.entities.values().find(|e| e.login == login).cloned()
    }

    pub fn edge_keys(&self) -> Vec<(i64, i64, EdgeDirection)> {
        let mut keys: Vec<_> = self.inner.lock().unwrap().edges.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn edge(&self, source: i64, target: i64, direction: EdgeDirection) -> Option<StoredEdge> {
        self.inner
            .lock()
            .unwrap()
            .edges
            .get(&(source, target, direction))
            .cloned()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    fn stub_to_entity(stub: &EntityStub) -> Entity {
        Entity {
            github_id: stub.github_id,
            login: stub.login.clone(),
            kind: stub.kind,
            name: None,
            location: None,
            company: None,
            bio: None,
            followers: 0,
            following: 0,
            public_repos: 0,
            avatar_url: None,
            profile_url: None,
            upstream_created_at: None,
            private_sponsor_count: 0,
            min_tier_cents: None,
            last_scraped: None,
            is_enriched: false,
            tombstoned: false,
        }
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn upsert_entity_stub(&self, stub: &EntityStub) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure()?;
        inner
            .entities
            .entry(stub.github_id)
            .or_insert_with(|| Self::stub_to_entity(stub));
        Ok(())
    }

    async fn upsert_entity_profile(&self, profile: &Profile) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure()?;
        let entry = inner
            .entities
            .entry(profile.github_id)
            .or_insert_with(|| {
                Self::stub_to_entity(&EntityStub {
                    github_id: profile.github_id,
                    login: profile.login.clone(),
                    kind: profile.kind,
                })
            });
        entry.login = profile.login.clone();
        entry.kind = profile.kind;
        entry.name = profile.name.clone();
        entry.location = profile.location.clone();
        entry.company = profile.company.clone();
        entry.bio = profile.bio.clone();
        entry.followers = profile.followers;
        entry.following = profile.following;
        entry.public_repos = profile.public_repos;
        entry.avatar_url = profile.avatar_url.clone();
        entry.profile_url = profile.profile_url.clone();
        entry.upstream_created_at = profile.upstream_created_at;
        entry.is_enriched = true;
        entry.tombstoned = false;
        Ok(())
    }

    async fn finalize_entity_scrape(
        &self,
        github_id: i64,
        private_sponsor_count: i64,
        min_tier_cents: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entity) = inner.entities.get_mut(&github_id) {
            entity.private_sponsor_count = private_sponsor_count;
            entity.min_tier_cents = min_tier_cents;
            entity.last_scraped = Some(now);
        }
        Ok(())
    }

    async fn tombstone_entity(&self, login: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for entity in inner.entities.values_mut() {
            if entity.login == login {
                entity.tombstoned = true;
            }
        }
        Ok(())
    }

    async fn get_entity(&self, github_id: i64) -> Result<Option<Entity>> {
        Ok(self.inner.lock().unwrap().entities.get(&github_id).cloned())
    }

    async fn upsert_activity(
        &self,
        github_id: i64,
        activity: &ActivityYear,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure()?;
        inner
            .activity
            .insert((github_id, activity.year), (*activity, now));
        Ok(())
    }

    async fn latest_activity_update(&self, github_id: i64) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .activity
            .iter()
            .filter(|((id, _), _)| *id == github_id)
            .map(|(_, (_, updated))| *updated)
            .max())
    }

    async fn upsert_edge(
        &self,
        source_id: i64,
        target_id: i64,
        direction: EdgeDirection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.take_write_failure()?;
        inner
            .edges
            .entry((source_id, target_id, direction))
            .and_modify(|e| e.last_seen = now)
            .or_insert(StoredEdge {
                first_seen: now,
                last_seen: now,
            });
        Ok(())
    }

    async fn enqueue_job(
        &self,
        login: &str,
        depth: i32,
        priority: i32,
        freshness_cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.by_login.get(login) {
            let job = inner.jobs.get_mut(&id).expect("login index out of sync");
            let reopen = job.state == JobState::Failed
                || (job.state == JobState::Done && job.updated_at < freshness_cutoff);
            if !reopen {
                return Ok(EnqueueOutcome::Duplicate { job_id: id });
            }
            job.state = JobState::Pending;
            job.depth = job.depth.min(depth);
            job.priority = job.priority.max(priority);
            job.attempts = 0;
            job.next_eligible_at = now;
            job.updated_at = now;
            job.last_error = None;
            return Ok(EnqueueOutcome::Queued { job_id: id });
        }

        let id = Uuid::new_v4();
        let job = CrawlJob {
            id,
            login: login.to_string(),
            github_id: None,
            depth,
            priority,
            state: JobState::Pending,
            attempts: 0,
            next_eligible_at: now,
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        inner.by_login.insert(login.to_string(), id);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.job_seq.insert(id, seq);
        inner.jobs.insert(id, job);
        Ok(EnqueueOutcome::Queued { job_id: id })
    }

    async fn dequeue_job(&self, now: DateTime<Utc>) -> Result<Option<CrawlJob>> {
        let mut inner = self.inner.lock().unwrap();
        let next = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending && j.next_eligible_at <= now)
            .min_by_key(|j| {
                let seq = inner.job_seq.get(&j.id).copied().unwrap_or(u64::MAX);
                (j.depth, -j.priority, j.created_at, seq, j.id)
            })
            .map(|j| j.id);
        let Some(id) = next else { return Ok(None) };
        let job = inner.jobs.get_mut(&id).unwrap();
        job.state = JobState::InProgress;
        job.attempts += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        id: Uuid,
        github_id: i64,
        new_priority: i32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.state = JobState::Done;
            job.github_id = Some(github_id);
            job.priority = new_priority;
            job.updated_at = now;
            job.last_error = None;
        }
        Ok(())
    }

    async fn reschedule_job(
        &self,
        id: Uuid,
        next_eligible_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.state = JobState::Pending;
            job.next_eligible_at = next_eligible_at;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        }
        Ok(())
    }

    async fn defer_job(&self, id: Uuid, until: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.state = JobState::Pending;
            job.attempts = (job.attempts - 1).max(0);
            job.next_eligible_at = until;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(&id) {
            job.state = JobState::Failed;
            job.last_error = Some(error.to_string());
            job.updated_at = now;
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<CrawlJob>> {
        Ok(self.inner.lock().unwrap().jobs.get(&id).cloned())
    }

    async fn get_job_by_login(&self, login: &str) -> Result<Option<CrawlJob>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .by_login
            .get(login)
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn list_jobs(&self, limit: i64) -> Result<Vec<CrawlJob>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<_> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn requeue_stale(
        &self,
        last_scraped_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let stale_ids: Vec<i64> = inner
            .entities
            .values()
            .filter(|e| {
                !e.tombstoned
                    && e.last_scraped
                        .map(|t| t < last_scraped_before)
                        .unwrap_or(false)
            })
            .map(|e| e.github_id)
            .collect();
        let mut reopened = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Done
                && job.github_id.map(|id| stale_ids.contains(&id)).unwrap_or(false)
            {
                job.state = JobState::Pending;
                job.attempts = 0;
                job.next_eligible_at = now;
                job.created_at = now;
                job.updated_at = now;
                reopened += 1;
            }
        }
        Ok(reopened)
    }

    async fn reclaim_abandoned(
        &self,
        updated_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let mut released = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::InProgress && job.updated_at < updated_before {
                job.state = JobState::Pending;
                job.next_eligible_at = now;
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn count_unfinished_jobs(&self) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Pending | JobState::InProgress))
            .count() as i64)
    }
}

// ---------------------------------------------------------------------------
// ScriptedUpstream
// ---------------------------------------------------------------------------

#[derive(Default)]
struct UpstreamInner {
    profiles: HashMap<String, Profile>,
    profile_errors: HashMap<String, VecDeque<UpstreamError>>,
    pages: HashMap<(String, EdgeDirection), Vec<EdgePage>>,
    edge_errors: HashMap<(String, EdgeDirection), VecDeque<UpstreamError>>,
    activity: HashMap<(String, i32), ActivityYear>,
    activity_errors: HashMap<String, VecDeque<UpstreamError>>,
    sponsorable_pages: Vec<Vec<EntityStub>>,
    profile_calls: u32,
    edge_calls: u32,
    activity_calls: u32,
    sponsorable_calls: u32,
}

/// Upstream fake. Scripted errors are consumed FIFO before the canned
/// success response; an unscripted login yields `NotFound`.
#[derive(Default)]
pub struct ScriptedUpstream {
    inner: Mutex<UpstreamInner>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_profile(&self, profile: Profile) {
        let mut inner = self.inner.lock().unwrap();
        inner.profiles.insert(profile.login.clone(), profile);
    }

    /// Queue an error returned (once) before the profile succeeds.
    pub fn push_profile_error(&self, login: &str, err: UpstreamError) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .profile_errors
            .entry(login.to_string())
            .or_default()
            .push_back(err);
    }

    /// Script the edge pages for one direction. Cursors are handled by the
    /// fake: page `i` links to page `i + 1`.
    pub fn set_pages(&self, login: &str, direction: EdgeDirection, pages: Vec<EdgePage>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pages.insert((login.to_string(), direction), pages);
    }

    pub fn push_edges_error(&self, login: &str, direction: EdgeDirection, err: UpstreamError) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .edge_errors
            .entry((login.to_string(), direction))
            .or_default()
            .push_back(err);
    }

    /// Script the contribution totals for one of a user's years. Unscripted
    /// years resolve to a zero record.
    pub fn set_activity(&self, login: &str, activity: ActivityYear) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .activity
            .insert((login.to_string(), activity.year), activity);
    }

    /// Queue an error returned (once) before any activity fetch for `login`.
    pub fn push_activity_error(&self, login: &str, err: UpstreamError) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .activity_errors
            .entry(login.to_string())
            .or_default()
            .push_back(err);
    }

    /// Script the sponsorable-search result pages, linked like edge pages.
    pub fn set_sponsorable_pages(&self, pages: Vec<Vec<EntityStub>>) {
        self.inner.lock().unwrap().sponsorable_pages = pages;
    }

    pub fn profile_calls(&self) -> u32 {
        self.inner.lock().unwrap().profile_calls
    }

    pub fn edge_calls(&self) -> u32 {
        self.inner.lock().unwrap().edge_calls
    }

    pub fn activity_calls(&self) -> u32 {
        self.inner.lock().unwrap().activity_calls
    }

    pub fn sponsorable_calls(&self) -> u32 {
        self.inner.lock().unwrap().sponsorable_calls
    }
}

/// Convenience profile for tests.
pub fn test_profile(github_id: i64, login: &str) -> Profile {
    Profile {
        github_id,
        login: login.to_string(),
        kind: EntityKind::User,
        name: Some(format!("The {login}")),
        location: None,
        company: None,
        bio: None,
        followers: 10,
        following: 2,
        public_repos: 5,
        avatar_url: None,
        profile_url: Some(format!("https://github.com/{login}")),
        upstream_created_at: None,
    }
}

/// Convenience single edge page naming the given neighbors.
pub fn test_page(neighbors: &[(i64, &str)]) -> EdgePage {
    EdgePage {
        neighbors: neighbors
            .iter()
            .map(|(id, login)| EntityStub {
                github_id: *id,
                login: login.to_string(),
                kind: EntityKind::User,
            })
            .collect(),
        next_cursor: None,
        total_count: neighbors.len() as i64,
        private_count: 0,
        min_tier_cents: None,
    }
}

#[async_trait]
impl Upstream for ScriptedUpstream {
    async fn fetch_profile(&self, login: &str) -> Result<Profile, UpstreamError> {
        let mut inner = self.inner.lock().unwrap();
        inner.profile_calls += 1;
        if let Some(errors) = inner.profile_errors.get_mut(login) {
            if let Some(err) = errors.pop_front() {
                return Err(err);
            }
        }
        inner
            .profiles
            .get(login)
            .cloned()
            .ok_or(UpstreamError::NotFound)
    }

    async fn fetch_edges_page(
        &self,
        login: &str,
        direction: EdgeDirection,
        cursor: Option<&str>,
    ) -> Result<EdgePage, UpstreamError> {
        let mut inner = self.inner.lock().unwrap();
        inner.edge_calls += 1;
        let key = (login.to_string(), direction);
        if let Some(errors) = inner.edge_errors.get_mut(&key) {
            if let Some(err) = errors.pop_front() {
                return Err(err);
            }
        }
        let pages = inner.pages.get(&key);
        let index: usize = match cursor {
            None => 0,
            Some(c) => c
                .parse()
                .map_err(|_| UpstreamError::Transient(format!("bad cursor {c}")))?,
        };
        let Some(pages) = pages else {
            return Ok(EdgePage::default());
        };
        let Some(page) = pages.get(index) else {
            return Ok(EdgePage::default());
        };
        let mut page = page.clone();
        page.next_cursor = if index + 1 < pages.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        Ok(page)
    }

    async fn fetch_activity_year(
        &self,
        login: &str,
        year: i32,
    ) -> Result<ActivityYear, UpstreamError> {
        let mut inner = self.inner.lock().unwrap();
        inner.activity_calls += 1;
        if let Some(errors) = inner.activity_errors.get_mut(login) {
            if let Some(err) = errors.pop_front() {
                return Err(err);
            }
        }
        Ok(inner
            .activity
            .get(&(login.to_string(), year))
            .copied()
            .unwrap_or_else(|| ActivityYear::empty(year)))
    }

    async fn fetch_sponsorable_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<SponsorablePage, UpstreamError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sponsorable_calls += 1;
        let index: usize = match cursor {
            None => 0,
            Some(c) => c
                .parse()
                .map_err(|_| UpstreamError::Transient(format!("bad cursor {c}")))?,
        };
        let Some(users) = inner.sponsorable_pages.get(index).cloned() else {
            return Ok(SponsorablePage::default());
        };
        let next_cursor = if index + 1 < inner.sponsorable_pages.len() {
            Some((index + 1).to_string())
        } else {
            None
        };
        Ok(SponsorablePage { users, next_cursor })
    }
}
