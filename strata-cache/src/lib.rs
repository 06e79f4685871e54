//! STRATA Cache - In-Memory Tier
//!
//! A bounded key/value cache with LRU eviction by entry count or total
//! weight, and per-entry expiry after write or after access.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` guards the access-ordered map; every
//!   operation is O(1) and never suspends while holding it.
//! - Expiry is driven by a [`Ticker`] rather than wall-clock time so tests
//!   can step time deterministically with [`FakeTicker`].
//! - Expired entries are treated as absent and removed on the read that
//!   finds them.
//!
//! # Example
//!
//! ```ignore
//! let cache: Cache<u64, String> = Cache::builder()
//!     .maximum_size(1_000)
//!     .expire_after_write(Duration::from_secs(300))
//!     .build()?;
//! cache.put(1, "one".to_string());
//! assert_eq!(cache.get(&1).as_deref(), Some("one"));
//! ```

mod cache;
mod ticker;

pub use cache::{Cache, CacheBuilder, CacheEntry, CacheStats, Capacity, Weigher};
pub use ticker::{FakeTicker, SystemTicker, Ticker};
