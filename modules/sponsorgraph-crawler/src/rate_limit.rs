//! Process-wide call budget for the upstream API.
//!
//! The limiter's estimate is never trusted for long: every response carries
//! `X-RateLimit-*` headers, and [`RateLimiter::record`] overwrites the local
//! count with the upstream-reported one, so drift cannot accumulate.

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use github_client::RateInfo;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Budget decremented; the call may proceed.
    Granted,
    /// Budget exhausted; retry no earlier than the given time.
    Deferred(DateTime<Utc>),
}

#[derive(Debug, Default)]
struct Budget {
    /// None until the first authoritative header refresh.
    remaining: Option<u32>,
    reset_at: Option<DateTime<Utc>>,
}

/// Single serialization point for budget decisions: the mutex makes
/// check-and-decrement atomic across concurrent workers.
pub struct RateLimiter {
    budget: Mutex<Budget>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            budget: Mutex::new(Budget::default()),
        }
    }

    /// Reserve `cost` calls. Never grants past the upstream-reported budget
    /// while the reset time is still in the future.
    pub async fn reserve(&self, cost: u32, now: DateTime<Utc>) -> Reservation {
        let mut budget = self.budget.lock().await;
        match (budget.remaining, budget.reset_at) {
            // Known-exhausted window still open: defer to the reset time.
            (Some(remaining), Some(reset_at)) if remaining < cost && now < reset_at => {
                Reservation::Deferred(reset_at)
            }
            (Some(remaining), _) if remaining >= cost => {
                budget.remaining = Some(remaining - cost);
                Reservation::Granted
            }
            // Window has reset; grant optimistically and let the next
            // response's headers re-seed the estimate.
            (Some(_), _) => {
                budget.remaining = None;
                budget.reset_at = None;
                debug!("Rate window reset, granting optimistically");
                Reservation::Granted
            }
            // No estimate yet — the first response will seed one.
            (None, _) => Reservation::Granted,
        }
    }

    /// Authoritative refresh from response headers. Overwrites the local
    /// estimate rather than accumulating drift.
    pub async fn record(&self, rate: &RateInfo) {
        if rate.remaining.is_none() && rate.reset_at.is_none() {
            return;
        }
        let mut budget = self.budget.lock().await;
        if let Some(remaining) = rate.remaining {
            budget.remaining = Some(remaining);
        }
        if let Some(reset_at) = rate.reset_at {
            budget.reset_at = Some(reset_at);
        }
        if rate.remaining == Some(0) {
            warn!(reset_at = ?budget.reset_at, "Upstream budget exhausted");
        }
    }

    /// Mark the budget exhausted (a 403/429 response said so).
    pub async fn record_exhausted(&self, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) {
        let mut budget = self.budget.lock().await;
        budget.remaining = Some(0);
        // Without a reported reset, back off for a minute rather than hammer.
        budget.reset_at = Some(reset_at.unwrap_or(now + chrono::Duration::seconds(60)));
    }

    /// Circuit-breaker view for the scheduler: when the budget is exhausted,
    /// the time all dequeues should pause until.
    pub async fn deferral(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let budget = self.budget.lock().await;
        match (budget.remaining, budget.reset_at) {
            (Some(0), Some(reset_at)) if now < reset_at => Some(reset_at),
            _ => None,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
