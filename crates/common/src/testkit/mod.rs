//! Harness for volume tests that need a store they can break.
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testkit::FaultyStore;
//!
//! let store = FaultyStore::memory();
//! // every superblock write fails until healed
//! store.fail_puts(|key| key.ends_with("/superblock"));
//! assert!(volume.unmount().await.is_err());
//! store.heal();
//! ```
mod faulty;

pub use faulty::FaultyStore;

use std::sync::Arc;

use store::{ObjectStorage, SharedStore};

/// Fresh process-local store.
pub fn memory_store() -> SharedStore {
    Arc::new(ObjectStorage::memory())
}
