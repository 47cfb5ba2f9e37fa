//! # LeafSync Storage
//!
//! Async key/value storage backends for LeafSync.
//!
//! This crate is the lowest layer of the sync and cache engine. Backends are
//! **opaque byte stores** keyed by strings - they do not interpret the values
//! they hold, and every other LeafSync component builds on them.
//!
//! ## Design Principles
//!
//! - One small async contract: `get`, `set`, `delete`, `keys`
//! - A missing key is `Ok(None)`, never an error
//! - I/O failures are surfaced, never swallowed
//! - Backends must be `Send + Sync` for concurrent access
//!
//! ## Available Backends
//!
//! - [`MemoryStorage`] - For testing and ephemeral caches
//! - [`FileStorage`] - One file per key, atomic write-temp-then-rename
//! - [`SecureStorage`] - Wrapper that encrypts values with AES-256-GCM using
//!   key material released by a [`Vault`]
//! - [`PrefixedStorage`] - Namespaced view over another backend
//!
//! ## Example
//!
//! ```rust
//! use leafsync_storage::{MemoryStorage, Storage};
//!
//! let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
//! rt.block_on(async {
//!     let storage = MemoryStorage::new();
//!     storage.set("greeting", b"hello").await.unwrap();
//!     assert_eq!(storage.get("greeting").await.unwrap(), Some(b"hello".to_vec()));
//!     assert_eq!(storage.get("missing").await.unwrap(), None);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod prefixed;
mod secure;

pub use backend::{validate_key, Storage, MAX_KEY_LEN};
pub use error::{StorageError, StorageResult};
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use prefixed::PrefixedStorage;
pub use secure::{EncryptionKey, MemoryVault, SecureStorage, Vault, KEY_SIZE, NONCE_SIZE, TAG_SIZE};
