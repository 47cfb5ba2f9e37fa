//! # LeafSync Cache
//!
//! A bounded, two-tier cache for content that is expensive to fetch:
//! paginated chapters, rich-text documents, cover images.
//!
//! ## Tiers
//!
//! 1. **Memory** - strict LRU bounded by entry count and total bytes
//! 2. **Durable** - any [`leafsync_storage::Storage`], bounded by total bytes
//!    with its own LRU order; entries evicted from memory stay here as a
//!    cold cache
//!
//! A miss in both tiers runs the caller's loader. Concurrent requests for the
//! same key share one loader run (single-flight), and a loader failure is
//! delivered identically to every waiter.
//!
//! ## Usage
//!
//! ```rust
//! use leafsync_cache::{BoundedCache, CacheConfig};
//! use leafsync_storage::MemoryStorage;
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! rt.block_on(async {
//!     let cache = BoundedCache::open(CacheConfig::default(), Arc::new(MemoryStorage::new()))
//!         .await
//!         .unwrap();
//!     let page = cache
//!         .fetch_or_load("chapter/12/page/3", || async {
//!             Ok::<_, std::io::Error>(b"In the beginning".to_vec())
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(&page[..], b"In the beginning");
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod entry;
mod error;
mod lru_tier;

pub use cache::{BoundedCache, CacheStats};
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult};
