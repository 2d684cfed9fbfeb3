//! Cache store for offline reads.
//!
//! Entries live in a namespace of the shared key-value storage and carry
//! their own expiry. There is no background sweep: an expired entry is
//! dropped when somebody reads it, and storage pressure is handled when a
//! write hits the quota.

mod entry;
mod store;

pub use entry::{CacheEntry, CacheStats, CachedResponse};
pub use store::{CacheStore, DATA_NAMESPACE, DEFAULT_TTL_SECS, PAGE_NAMESPACE};
