use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority assigned to externally requested seeds (depth 0).
pub const SEED_PRIORITY: i32 = 10;
/// Priority assigned to entities discovered through edges.
pub const DISCOVERED_PRIORITY: i32 = 5;
/// Priority assigned to entities found by the sponsorable-search backfill.
pub const BACKFILL_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;
pub const MIN_PRIORITY: i32 = 1;

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Organization,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Organization => "organization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(EntityKind::User),
            "organization" => Some(EntityKind::Organization),
            _ => None,
        }
    }
}

/// Direction of a sponsorship edge relative to its source entity.
///
/// `Sponsors`: source receives money from target (target is a sponsor of source).
/// `Sponsoring`: source pays target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeDirection {
    Sponsors,
    Sponsoring,
}

impl EdgeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeDirection::Sponsors => "sponsors",
            EdgeDirection::Sponsoring => "sponsoring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sponsors" => Some(EdgeDirection::Sponsors),
            "sponsoring" => Some(EdgeDirection::Sponsoring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::InProgress => "in_progress",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "in_progress" => Some(JobState::InProgress),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    /// Terminal states are never transitioned out of by the worker loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

// --- Entities ---

/// Full profile as returned by the upstream provider's REST lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub github_id: i64,
    pub login: String,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    pub bio: Option<String>,
    pub followers: i64,
    pub following: i64,
    pub public_repos: i64,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
    pub upstream_created_at: Option<DateTime<Utc>>,
}

/// Minimal identity known about a neighbor before it has been crawled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityStub {
    pub github_id: i64,
    pub login: String,
    pub kind: EntityKind,
}

/// A persisted graph node. Stub rows carry only identity fields until the
/// entity itself is crawled and enriched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub github_id: i64,
    pub login: String,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    pub bio: Option<String>,
    pub followers: i64,
    pub following: i64,
    pub public_repos: i64,
    pub avatar_url: Option<String>,
    pub profile_url: Option<String>,
    pub upstream_created_at: Option<DateTime<Utc>>,
    pub private_sponsor_count: i64,
    pub min_tier_cents: Option<i64>,
    pub last_scraped: Option<DateTime<Utc>>,
    pub is_enriched: bool,
    pub tombstoned: bool,
}

/// One calendar year of a user's contribution activity. Organizations have
/// no contribution data and never get activity rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityYear {
    pub year: i32,
    pub commits: i64,
    pub pull_requests: i64,
    pub issues: i64,
    pub reviews: i64,
}

impl ActivityYear {
    /// Zero record for a year the upstream reported no data for.
    pub fn empty(year: i32) -> Self {
        Self {
            year,
            commits: 0,
            pull_requests: 0,
            issues: 0,
            reviews: 0,
        }
    }
}

// --- Crawl jobs ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub id: Uuid,
    pub login: String,
    /// Resolved on first successful profile fetch.
    pub github_id: Option<i64>,
    pub depth: i32,
    pub priority: i32,
    pub state: JobState,
    pub attempts: i32,
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// Result of an enqueue attempt. `Duplicate` is the dedup no-op: a job for
/// this login is already pending, in progress, or done within the freshness
/// window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Queued { job_id: Uuid },
    Duplicate { job_id: Uuid },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Queued { job_id } | EnqueueOutcome::Duplicate { job_id } => *job_id,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trips() {
        for kind in [EntityKind::User, EntityKind::Organization] {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
        }
        for dir in [EdgeDirection::Sponsors, EdgeDirection::Sponsoring] {
            assert_eq!(EdgeDirection::parse(dir.as_str()), Some(dir));
        }
        for state in [
            JobState::Pending,
            JobState::InProgress,
            JobState::Done,
            JobState::Failed,
        ] {
            assert_eq!(JobState::parse(state.as_str()), Some(state));
        }
        assert_eq!(EntityKind::parse("robot"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Done.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::InProgress.is_terminal());
    }
}
