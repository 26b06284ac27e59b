pub mod migrate;
pub mod store;

pub use migrate::migrate;
pub use store::PgStore;
