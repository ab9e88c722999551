//! In-memory caching primitives
//!
//! - [`TtlCache`]: expiring store with approximate LRU eviction
//! - [`AsyncCache`]: single-flight fetch-through cache
//! - [`generate_cache_key`]: order-insensitive parameter hashing
//! - [`CacheSweeper`]: background removal of expired entries

pub mod async_cache;
pub mod key;
pub mod sweeper;
pub mod ttl_cache;

pub use async_cache::AsyncCache;
pub use key::generate_cache_key;
pub use sweeper::{CacheSweeper, Sweepable};
pub use ttl_cache::{CacheStats, TtlCache};
