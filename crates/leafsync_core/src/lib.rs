//! # LeafSync Core
//!
//! The record model and the durable, versioned record store that the sync
//! engine reconciles against a remote.
//!
//! This crate provides:
//! - [`Record`] and [`RemoteRecord`], the local and remote views of a record
//! - [`RecordStore`], a per-collection store that versions every local write
//! - [`EventNotifier`], a broadcast of record changes and sync results
//! - [`Clock`] implementations for stamping writes
//!
//! ## Design Principles
//!
//! - **Versions belong to the store**: `local_version` increases by one on
//!   every local write and never decreases
//! - **Deletes are tombstones**: they sync and resolve like any other write
//! - **Remote application is idempotent**: re-applying a known remote version
//!   is a no-op
//!
//! ## Example
//!
//! ```rust
//! use leafsync_core::{EventNotifier, RecordStore, StoreOptions};
//! use leafsync_storage::MemoryStorage;
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! rt.block_on(async {
//!     let store = RecordStore::open(
//!         "highlights",
//!         Arc::new(MemoryStorage::new()),
//!         EventNotifier::new(),
//!         StoreOptions::new("phone"),
//!     )
//!     .await
//!     .unwrap();
//!
//!     let record = store.put("h-1", b"chapter 3, para 2".to_vec()).await.unwrap();
//!     assert_eq!(record.local_version, 1);
//!     assert_eq!(store.pending().len(), 1);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod codec;
mod error;
mod events;
mod outcome;
mod record;
mod store;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::{from_cbor, to_cbor};
pub use error::{CoreError, CoreResult};
pub use events::{ChangeOrigin, EventNotifier, Subscription, SyncEvent, DEFAULT_EVENT_CAPACITY};
pub use outcome::{ConflictReport, Resolution, SyncFailure, SyncOutcome};
pub use record::{Record, RecordValue, RemoteRecord};
pub use store::{MergeOutcome, RecordStore, StoreOptions, RECORD_PREFIX};
pub use types::{RecordId, Timestamp};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
