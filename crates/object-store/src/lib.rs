//! Bucket-scoped object storage for cloudfs
//!
//! This crate provides the narrow storage surface the volume engine needs:
//! whole-object `get`/`put`/`delete` plus prefix listing, bound to a single
//! bucket. Backends are built on the `object_store` crate:
//!
//! - `dummy`: a local directory per bucket (development and tests)
//! - `amazon`: AWS S3 or any S3-compatible endpoint
//! - `google`: Google Cloud Storage
//! - `memory`: process-local, for tests
//!
//! Errors are classified as transient (retryable) or permanent so callers can
//! wrap any backend in a [`RetryingStore`].
//!
//! # Example
//!
//! ```rust,no_run
//! use cloudfs_object_store::{open_store, RetryPolicy, StoreConfig};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), cloudfs_object_store::StoreError> {
//! let config = StoreConfig::Dummy { path: PathBuf::from("/tmp/cloudfs") };
//! let store = open_store(&config, "my-bucket", RetryPolicy::default(), true).await?;
//! store.put("volume/superblock", b"hello".to_vec().into()).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod retry;
mod storage;
mod store;

pub use error::{Result, StoreError};
pub use retry::{RetryPolicy, RetryingStore};
pub use storage::{open_store, ObjectStorage, StoreConfig, StoreKind};
pub use store::{SharedStore, Store};
