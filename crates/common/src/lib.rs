/**
 * Write-back block cache with a byte bound.
 *  Dirty blocks are flushed before they are evicted.
 */
pub mod cache;
/**
 * Chunk identity: object keys and the context
 *  every sealed chunk is bound to.
 */
pub mod chunk;
/**
 * Engine configuration and size parsing.
 */
pub mod config;
/**
 * Password-derived keys, chunk sealing and
 *  the random source.
 */
pub mod crypto;
/**
 * Bounded worker pool for store I/O.
 */
pub mod pool;
/**
 * Fault-injecting store for tests.
 */
pub mod testkit;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;
/**
 * Volumes: lifecycle, block and tree I/O,
 *  fsck and deletion.
 */
pub mod volume;

pub mod prelude {
    pub use crate::build_info;
    pub use crate::config::{parse_size, CacheConfig, CacheKind, EngineConfig};
    pub use crate::pool::{PoolHandle, WorkerPool};
    pub use crate::version::BuildInfo;
    pub use crate::volume::{
        delete, fsck, list_volumes, CreateOptions, FsckOptions, FsckReport, MountOptions,
        Volume, VolumeError, VolumeFormat, VolumeInfo,
    };
}
