pub mod cache;

pub use cache::{CacheConfig, CacheState, CacheStatus, EngagementCache};
