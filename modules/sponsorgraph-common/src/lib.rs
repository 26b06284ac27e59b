pub mod config;
pub mod types;

pub use config::Config;
pub use types::{
    ActivityYear, CrawlJob, EdgeDirection, EnqueueOutcome, Entity, EntityKind, EntityStub,
    JobState, Profile, BACKFILL_PRIORITY, DISCOVERED_PRIORITY, MAX_PRIORITY, MIN_PRIORITY,
    SEED_PRIORITY,
};
