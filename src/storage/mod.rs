pub mod batch;
pub mod dedup;
pub mod queue;
pub mod ratelimit;
pub mod store;

// Re-export common types
pub use batch::{BatchItem, BatchWriter};
pub use dedup::DedupGuard;
pub use queue::TaskQueue;
pub use ratelimit::RateLimiter;
pub use store::PgStore;
