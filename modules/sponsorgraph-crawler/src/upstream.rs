//! Production [`Upstream`] implementation: the pure GitHub client wrapped
//! with budget reservation and a transient-retry ceiling.
//!
//! Every outbound call reserves budget first. A deferred reservation sleeps
//! until the reset time (suspending only the calling task) and retries the
//! reservation once. Transient failures back off exponentially up to the
//! attempt ceiling; NotFound and budget exhaustion surface immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::warn;

use github_client::{EdgePage, GitHubClient, GitHubError, RateInfo, SponsorablePage};
use sponsorgraph_common::{ActivityYear, EdgeDirection, Profile};

use crate::backoff;
use crate::rate_limit::{RateLimiter, Reservation};
use crate::traits::{Upstream, UpstreamError};

#[derive(Debug, Clone)]
pub struct UpstreamPolicy {
    /// Attempts per call before a transient failure is surfaced.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for UpstreamPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(900),
        }
    }
}

pub struct GitHubUpstream {
    client: GitHubClient,
    limiter: Arc<RateLimiter>,
    policy: UpstreamPolicy,
    shutdown: watch::Receiver<bool>,
}

impl GitHubUpstream {
    pub fn new(
        client: GitHubClient,
        limiter: Arc<RateLimiter>,
        policy: UpstreamPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            limiter,
            policy,
            shutdown,
        }
    }

    /// Sleep until `until`, returning early with an error on shutdown.
    async fn sleep_until(&self, until: DateTime<Utc>) -> Result<(), UpstreamError> {
        let dur = (until - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.sleep(dur).await
    }

    async fn sleep(&self, dur: Duration) -> Result<(), UpstreamError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = shutdown.changed() => {
                Err(UpstreamError::Transient("shutdown during wait".to_string()))
            }
        }
    }

    /// Reserve one call. On deferral, wait out the reset and retry once.
    async fn reserve_or_defer(&self) -> Result<(), UpstreamError> {
        match self.limiter.reserve(1, Utc::now()).await {
            Reservation::Granted => Ok(()),
            Reservation::Deferred(until) => {
                self.sleep_until(until).await?;
                match self.limiter.reserve(1, Utc::now()).await {
                    Reservation::Granted => Ok(()),
                    Reservation::Deferred(until) => Err(UpstreamError::RateLimited {
                        reset_at: Some(until),
                    }),
                }
            }
        }
    }

    async fn note_exhaustion(&self, err: &UpstreamError) {
        if let UpstreamError::RateLimited { reset_at } = err {
            self.limiter.record_exhausted(*reset_at, Utc::now()).await;
        }
    }

    /// Shared retry loop: reserve budget, call, record the rate snapshot,
    /// back off on retryable failures up to the attempt ceiling.
    async fn call<T, Fut, F>(&self, label: &str, mut op: F) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = github_client::Result<(T, RateInfo)>> + Send,
    {
        let mut attempt = 0u32;
        loop {
            self.reserve_or_defer().await?;
            match op().await {
                Ok((value, rate)) => {
                    self.limiter.record(&rate).await;
                    return Ok(value);
                }
                Err(err) => {
                    let (mapped, retryable) = classify(err);
                    self.note_exhaustion(&mapped).await;
                    attempt += 1;
                    if !retryable || attempt >= self.policy.max_attempts {
                        return Err(mapped);
                    }
                    let delay = backoff::with_jitter(backoff::retry_delay(
                        self.policy.backoff_base,
                        self.policy.backoff_cap,
                        attempt - 1,
                    ));
                    warn!(
                        call = label,
                        attempt,
                        ?delay,
                        error = %mapped,
                        "Upstream call failed, retrying"
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }
}

/// Map a client error to the upstream taxonomy, with whether it is worth
/// retrying locally. 4xx responses (other than 404 and rate-limit 403s,
/// which the client already distinguishes) fail fast.
fn classify(err: GitHubError) -> (UpstreamError, bool) {
    match err {
        GitHubError::NotFound(_) => (UpstreamError::NotFound, false),
        GitHubError::RateLimited { reset_at } => (UpstreamError::RateLimited { reset_at }, false),
        GitHubError::Api { status, message } if (500..600).contains(&status) => (
            UpstreamError::Transient(format!("upstream {status}: {message}")),
            true,
        ),
        // GraphQL-level errors arrive as status 200; a partial page must
        // never be synced, but the next attempt may succeed.
        GitHubError::Api {
            status: 200,
            message,
        } => (UpstreamError::Transient(message), true),
        GitHubError::Api { status, message } => (
            UpstreamError::Transient(format!("upstream {status}: {message}")),
            false,
        ),
        GitHubError::Network(m) | GitHubError::Parse(m) => (UpstreamError::Transient(m), true),
    }
}

#[async_trait]
impl Upstream for GitHubUpstream {
    async fn fetch_profile(&self, login: &str) -> Result<Profile, UpstreamError> {
        let client = &self.client;
        self.call("profile", move || client.get_profile(login)).await
    }

    async fn fetch_edges_page(
        &self,
        login: &str,
        direction: EdgeDirection,
        cursor: Option<&str>,
    ) -> Result<EdgePage, UpstreamError> {
        let client = &self.client;
        self.call("edges_page", move || {
            client.edges_page(login, direction, cursor)
        })
        .await
    }

    async fn fetch_activity_year(
        &self,
        login: &str,
        year: i32,
    ) -> Result<ActivityYear, UpstreamError> {
        let client = &self.client;
        self.call("activity_year", move || client.activity_year(login, year))
            .await
    }

    async fn fetch_sponsorable_page(
        &self,
        cursor: Option<&str>,
    ) -> Result<SponsorablePage, UpstreamError> {
        let client = &self.client;
        self.call("sponsorable_page", move || client.sponsorable_page(cursor))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let (err, retryable) = classify(GitHubError::Api {
            status: 503,
            message: "unavailable".into(),
        });
        assert!(matches!(err, UpstreamError::Transient(_)));
        assert!(retryable);
    }

    #[test]
    fn client_errors_fail_fast() {
        let (err, retryable) = classify(GitHubError::Api {
            status: 422,
            message: "unprocessable".into(),
        });
        assert!(matches!(err, UpstreamError::Transient(_)));
        assert!(!retryable);
    }

    #[test]
    fn not_found_is_terminal() {
        let (err, retryable) = classify(GitHubError::NotFound("ghost".into()));
        assert!(matches!(err, UpstreamError::NotFound));
        assert!(!retryable);
    }

    #[test]
    fn graphql_partial_pages_are_retryable() {
        let (err, retryable) = classify(GitHubError::Api {
            status: 200,
            message: "GraphQL errors: timeout".into(),
        });
        assert!(matches!(err, UpstreamError::Transient(_)));
        assert!(retryable);
    }
}
