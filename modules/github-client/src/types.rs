use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use sponsorgraph_common::{ActivityYear, EntityKind, EntityStub, Profile};

/// Quota snapshot parsed from `X-RateLimit-*` response headers.
/// All fields optional — unauthenticated or proxied responses may omit them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateInfo {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateInfo {
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        fn parse<T: std::str::FromStr>(
            headers: &reqwest::header::HeaderMap,
            name: &str,
        ) -> Option<T> {
            headers.get(name)?.to_str().ok()?.parse().ok()
        }

        let reset_at = parse::<i64>(headers, "x-ratelimit-reset")
            .and_then(|epoch| Utc.timestamp_opt(epoch, 0).single());

        Self {
            remaining: parse(headers, "x-ratelimit-remaining"),
            limit: parse(headers, "x-ratelimit-limit"),
            reset_at,
        }
    }
}

/// One page of sponsorship edges for an entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgePage {
    pub neighbors: Vec<EntityStub>,
    pub next_cursor: Option<String>,
    /// Total count reported by the API (all pages).
    pub total_count: i64,
    /// Sponsorships hidden behind `privacyLevel: PRIVATE` — counted, not edges.
    pub private_count: i64,
    /// Lowest monthly tier price, present only on the first sponsors page.
    pub min_tier_cents: Option<i64>,
}

/// One page of `is:sponsorable` search results, used to backfill the queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SponsorablePage {
    pub users: Vec<EntityStub>,
    pub next_cursor: Option<String>,
}

// --- REST /users/{login} payload ---

#[derive(Debug, Deserialize)]
pub(crate) struct RawProfile {
    pub id: i64,
    pub login: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub company: Option<String>,
    pub bio: Option<String>,
    #[serde(default)]
    pub followers: i64,
    #[serde(default)]
    pub following: i64,
    #[serde(default)]
    pub public_repos: i64,
    pub avatar_url: Option<String>,
    pub html_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl RawProfile {
    pub fn into_profile(self) -> Profile {
        let kind = if self.kind.eq_ignore_ascii_case("organization") {
            EntityKind::Organization
        } else {
            EntityKind::User
        };
        Profile {
            github_id: self.id,
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
            profile_url: self.html_url,
            upstream_created_at: self.created_at,
        }
    }
}

// --- GraphQL payloads ---

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlResponse<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlData {
    #[serde(rename = "repositoryOwner")]
    pub repository_owner: Option<RepositoryOwner>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RepositoryOwner {
    #[serde(rename = "sponsorshipsAsMaintainer")]
    pub sponsorships_as_maintainer: Option<SponsorshipConnection>,
    #[serde(rename = "sponsorshipsAsSponsor")]
    pub sponsorships_as_sponsor: Option<SponsorshipConnection>,
    #[serde(rename = "sponsorsListing")]
    pub sponsors_listing: Option<SponsorsListing>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SponsorshipConnection {
    #[serde(rename = "totalCount", default)]
    pub total_count: i64,
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    #[serde(default)]
    pub nodes: Vec<Option<SponsorshipNode>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageInfo {
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
    #[serde(rename = "hasNextPage", default)]
    pub has_next_page: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SponsorshipNode {
    #[serde(rename = "privacyLevel")]
    pub privacy_level: Option<String>,
    /// Present on `sponsorshipsAsMaintainer` nodes.
    #[serde(rename = "sponsorEntity")]
    pub sponsor_entity: Option<ActorRef>,
    /// Present on `sponsorshipsAsSponsor` nodes.
    pub sponsorable: Option<ActorRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActorRef {
    #[serde(rename = "__typename")]
    pub typename: Option<String>,
    #[serde(rename = "databaseId")]
    pub database_id: Option<i64>,
    pub login: Option<String>,
}

impl ActorRef {
    pub fn into_stub(self) -> Option<EntityStub> {
        let github_id = self.database_id?;
        let login = self.login?;
        let kind = match self.typename.as_deref() {
            Some("Organization") => EntityKind::Organization,
            _ => EntityKind::User,
        };
        Some(EntityStub {
            github_id,
            login,
            kind,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActivityData {
    pub user: Option<ActivityUser>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ActivityUser {
    #[serde(rename = "contributionsCollection")]
    pub contributions_collection: Option<ContributionsCollection>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContributionsCollection {
    #[serde(rename = "totalCommitContributions", default)]
    pub commits: i64,
    #[serde(rename = "totalPullRequestContributions", default)]
    pub pull_requests: i64,
    #[serde(rename = "totalIssueContributions", default)]
    pub issues: i64,
    #[serde(rename = "totalPullRequestReviewContributions", default)]
    pub reviews: i64,
}

impl ContributionsCollection {
    pub fn into_activity(self, year: i32) -> ActivityYear {
        ActivityYear {
            year,
            commits: self.commits,
            pull_requests: self.pull_requests,
            issues: self.issues,
            reviews: self.reviews,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchData {
    pub search: Option<SearchConnection>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchConnection {
    #[serde(rename = "pageInfo")]
    pub page_info: PageInfo,
    #[serde(default)]
    pub edges: Vec<Option<SearchEdge>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchEdge {
    pub node: Option<ActorRef>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SponsorsListing {
    pub tiers: Option<TierConnection>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TierConnection {
    #[serde(default)]
    pub nodes: Vec<Tier>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Tier {
    #[serde(rename = "monthlyPriceInCents")]
    pub monthly_price_in_cents: Option<i64>,
    #[serde(rename = "isOneTime", default)]
    pub is_one_time: bool,
}
