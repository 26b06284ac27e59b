//! Breadth-first sponsorship-graph crawler.
//!
//! Jobs flow pending → in_progress → done/failed through the [`queue`]
//! state machine; [`worker`] turns a claimed job into entities and edges via
//! the [`traits::Upstream`] seam; [`scheduler`] runs the worker pool under
//! the shared [`rate_limit::RateLimiter`].

pub mod backoff;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod traits;
pub mod upstream;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use queue::{JobQueue, QueuePolicy};
pub use rate_limit::{RateLimiter, Reservation};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use traits::{GraphStore, Upstream, UpstreamError};
pub use upstream::{GitHubUpstream, UpstreamPolicy};
pub use worker::{CrawlWorker, JobOutcome};
