pub mod cache;

pub use cache::{Cache, CacheLookup, CacheStatistics};
