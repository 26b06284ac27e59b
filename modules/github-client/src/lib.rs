//! Pure GitHub API client for sponsorship crawling.
//!
//! Talks to the REST API for profile lookups and the GraphQL API for
//! paginated sponsor/sponsoring edges. No retry or scheduling policy lives
//! here — callers own backoff and budget decisions. Every call surfaces the
//! `X-RateLimit-*` snapshot so the caller can keep its budget authoritative.

pub mod error;
pub mod types;

pub use error::{GitHubError, Result};
pub use types::{EdgePage, RateInfo, SponsorablePage};

use sponsorgraph_common::{ActivityYear, EdgeDirection, Profile};
use types::{ActivityData, GraphQlData, GraphQlResponse, RawProfile, SearchData};

const REST_BASE: &str = "https://api.github.com";
const GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Page size for sponsorship connections. GitHub caps `first` at 100.
const PAGE_SIZE: u32 = 100;

const SPONSORS_QUERY: &str = r#"
query($login: String!, $cursor: String, $includeListing: Boolean!) {
  repositoryOwner(login: $login) {
    ... on Sponsorable {
      sponsorshipsAsMaintainer(first: 100, after: $cursor, includePrivate: true) {
        totalCount
        pageInfo { endCursor hasNextPage }
        nodes {
          privacyLevel
          sponsorEntity {
            __typename
            ... on User { databaseId login }
            ... on Organization { databaseId login }
          }
        }
      }
      sponsorsListing @include(if: $includeListing) {
        tiers(first: 20) {
          nodes { monthlyPriceInCents isOneTime }
        }
      }
    }
  }
}
"#;

const SPONSORING_QUERY: &str = r#"
query($login: String!, $cursor: String) {
  repositoryOwner(login: $login) {
    ... on Sponsorable {
      sponsorshipsAsSponsor(first: 100, after: $cursor) {
        totalCount
        pageInfo { endCursor hasNextPage }
        nodes {
          sponsorable {
            __typename
            ... on User { databaseId login }
            ... on Organization { databaseId login }
          }
        }
      }
    }
  }
}
"#;

const ACTIVITY_QUERY: &str = r#"
query($login: String!, $from: DateTime!, $to: DateTime!) {
  user(login: $login) {
    contributionsCollection(from: $from, to: $to) {
      totalCommitContributions
      totalPullRequestContributions
      totalIssueContributions
      totalPullRequestReviewContributions
    }
  }
}
"#;

const SPONSORABLE_QUERY: &str = r#"
query($search: String!, $cursor: String) {
  search(query: $search, type: USER, first: 100, after: $cursor) {
    pageInfo { endCursor hasNextPage }
    edges {
      node {
        __typename
        ... on User { databaseId login }
        ... on Organization { databaseId login }
      }
    }
  }
}
"#;

/// Newest-joined first, so incremental backfills find recent accounts early.
const SPONSORABLE_SEARCH: &str = "is:sponsorable sort:joined-desc";

pub struct GitHubClient {
    client: reqwest::Client,
    token: String,
    rest_base: String,
    graphql_url: String,
}

impl GitHubClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            rest_base: REST_BASE.to_string(),
            graphql_url: GRAPHQL_URL.to_string(),
        }
    }

    /// Point the client at alternate endpoints (local stub servers).
    pub fn with_endpoints(token: String, rest_base: String, graphql_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            rest_base,
            graphql_url,
        }
    }

    /// Fetch an entity's profile via `GET /users/{login}`.
    pub async fn get_profile(&self, login: &str) -> Result<(Profile, RateInfo)> {
        let url = format!("{}/users/{}", self.rest_base, login);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("User-Agent", "sponsorgraph-crawler")
            .send()
            .await?;

        let rate = RateInfo::from_headers(resp.headers());
        let status = resp.status();

        if status.as_u16() == 404 {
            return Err(GitHubError::NotFound(login.to_string()));
        }
        if rate.remaining == Some(0) && (status.as_u16() == 403 || status.as_u16() == 429) {
            return Err(GitHubError::RateLimited {
                reset_at: rate.reset_at,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let raw: RawProfile = resp.json().await.map_err(GitHubError::from)?;
        tracing::debug!(login, remaining = ?rate.remaining, "Fetched profile");
        Ok((raw.into_profile(), rate))
    }

    /// Fetch one page of sponsorship edges in the given direction.
    /// `cursor: None` requests the first page (which, for `Sponsors`, also
    /// carries the tier listing used to derive `min_tier_cents`).
    pub async fn edges_page(
        &self,
        login: &str,
        direction: EdgeDirection,
        cursor: Option<&str>,
    ) -> Result<(EdgePage, RateInfo)> {
        let query = match direction {
            EdgeDirection::Sponsors => SPONSORS_QUERY,
            EdgeDirection::Sponsoring => SPONSORING_QUERY,
        };
        let mut variables = serde_json::json!({
            "login": login,
            "cursor": cursor,
        });
        if direction == EdgeDirection::Sponsors {
            variables["includeListing"] = serde_json::Value::Bool(cursor.is_none());
        }

        let (body, rate) = self.graphql(query, variables).await?;
        let page = parse_edge_page(&body, direction, login)?;
        tracing::debug!(
            login,
            direction = direction.as_str(),
            neighbors = page.neighbors.len(),
            has_next = page.next_cursor.is_some(),
            remaining = ?rate.remaining,
            "Fetched edge page"
        );
        Ok((page, rate))
    }

    /// Fetch one calendar year of a user's contribution totals.
    pub async fn activity_year(&self, login: &str, year: i32) -> Result<(ActivityYear, RateInfo)> {
        let variables = serde_json::json!({
            "login": login,
            "from": format!("{year}-01-01T00:00:00Z"),
            "to": format!("{year}-12-31T23:59:59Z"),
        });
        let (body, rate) = self.graphql(ACTIVITY_QUERY, variables).await?;
        let activity = parse_activity(&body, login, year)?;
        tracing::debug!(login, year, remaining = ?rate.remaining, "Fetched activity year");
        Ok((activity, rate))
    }

    /// Fetch one page of the `is:sponsorable` user search. The search API
    /// caps results at 1000 per query, so callers bound their page count.
    pub async fn sponsorable_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<(SponsorablePage, RateInfo)> {
        let variables = serde_json::json!({
            "search": SPONSORABLE_SEARCH,
            "cursor": cursor,
        });
        let (body, rate) = self.graphql(SPONSORABLE_QUERY, variables).await?;
        let page = parse_sponsorable_page(&body)?;
        tracing::debug!(
            found = page.users.len(),
            has_next = page.next_cursor.is_some(),
            "Fetched sponsorable search page"
        );
        Ok((page, rate))
    }

    /// Shared GraphQL POST: rate headers, 403/429 exhaustion, non-2xx mapping.
    async fn graphql(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<(String, RateInfo)> {
        let resp = self
            .client
            .post(&self.graphql_url)
            .bearer_auth(&self.token)
            .header("User-Agent", "sponsorgraph-crawler")
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let rate = RateInfo::from_headers(resp.headers());
        let status = resp.status();

        if rate.remaining == Some(0) && (status.as_u16() == 403 || status.as_u16() == 429) {
            return Err(GitHubError::RateLimited {
                reset_at: rate.reset_at,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GitHubError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok((resp.text().await?, rate))
    }
}

/// Parse a GraphQL response body into an [`EdgePage`].
///
/// A response with top-level `errors` is treated as a failed (partial) fetch —
/// the original data must never be synced from an incomplete page. A null
/// `repositoryOwner` means the login does not exist upstream.
pub(crate) fn parse_edge_page(
    body: &str,
    direction: EdgeDirection,
    login: &str,
) -> Result<EdgePage> {
    let resp: GraphQlResponse<GraphQlData> = serde_json::from_str(body)?;

    if !resp.errors.is_empty() {
        return Err(GitHubError::Api {
            status: 200,
            message: format!("GraphQL errors: {}", serde_json::Value::Array(resp.errors)),
        });
    }

    let owner = resp
        .data
        .and_then(|d| d.repository_owner)
        .ok_or_else(|| GitHubError::NotFound(login.to_string()))?;

    let min_tier_cents = owner.sponsors_listing.as_ref().and_then(|listing| {
        listing.tiers.as_ref().and_then(|tiers| {
            tiers
                .nodes
                .iter()
                .filter(|t| !t.is_one_time)
                .filter_map(|t| t.monthly_price_in_cents)
                .min()
        })
    });

    let connection = match direction {
        EdgeDirection::Sponsors => owner.sponsorships_as_maintainer,
        EdgeDirection::Sponsoring => owner.sponsorships_as_sponsor,
    };

    // An absent connection means the entity cannot be sponsored / sponsor in
    // this direction — an empty final page, not an error.
    let Some(connection) = connection else {
        return Ok(EdgePage {
            min_tier_cents,
            ..EdgePage::default()
        });
    };

    let mut neighbors = Vec::new();
    let mut private_count = 0i64;
    for node in connection.nodes.into_iter().flatten() {
        if node.privacy_level.as_deref() == Some("PRIVATE") {
            private_count += 1;
            continue;
        }
        let actor = match direction {
            EdgeDirection::Sponsors => node.sponsor_entity,
            EdgeDirection::Sponsoring => node.sponsorable,
        };
        if let Some(stub) = actor.and_then(|a| a.into_stub()) {
            neighbors.push(stub);
        }
    }

    let next_cursor = if connection.page_info.has_next_page {
        connection.page_info.end_cursor
    } else {
        None
    };

    Ok(EdgePage {
        neighbors,
        next_cursor,
        total_count: connection.total_count,
        private_count,
        min_tier_cents,
    })
}

/// Parse one `contributionsCollection` response. A null `user` means the
/// login no longer resolves; a null collection yields a zero record so the
/// year is still marked as covered.
pub(crate) fn parse_activity(body: &str, login: &str, year: i32) -> Result<ActivityYear> {
    let resp: GraphQlResponse<ActivityData> = serde_json::from_str(body)?;

    if !resp.errors.is_empty() {
        return Err(GitHubError::Api {
            status: 200,
            message: format!("GraphQL errors: {}", serde_json::Value::Array(resp.errors)),
        });
    }

    let user = resp
        .data
        .and_then(|d| d.user)
        .ok_or_else(|| GitHubError::NotFound(login.to_string()))?;

    Ok(user
        .contributions_collection
        .map(|c| c.into_activity(year))
        .unwrap_or_else(|| ActivityYear::empty(year)))
}

/// Parse one `is:sponsorable` search page. Nodes that are not users or
/// organizations (or lack a database id) are skipped.
pub(crate) fn parse_sponsorable_page(body: &str) -> Result<SponsorablePage> {
    let resp: GraphQlResponse<SearchData> = serde_json::from_str(body)?;

    if !resp.errors.is_empty() {
        return Err(GitHubError::Api {
            status: 200,
            message: format!("GraphQL errors: {}", serde_json::Value::Array(resp.errors)),
        });
    }

    let Some(search) = resp.data.and_then(|d| d.search) else {
        return Ok(SponsorablePage::default());
    };

    let users = search
        .edges
        .into_iter()
        .flatten()
        .filter_map(|edge| edge.node)
        .filter_map(|actor| actor.into_stub())
        .collect();

    let next_cursor = if search.page_info.has_next_page {
        search.page_info.end_cursor
    } else {
        None
    };

    Ok(SponsorablePage { users, next_cursor })
}
