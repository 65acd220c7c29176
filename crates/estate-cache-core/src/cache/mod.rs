//! Cache storage for the offline controller.
//!
//! `CacheStorage` is the set of named buckets; `CacheBucket` is one bucket
//! mapping request identity to a stored response. Two backends:
//! - `MemoryCacheStorage`: in-process, used by tests and embedders
//! - `DiskCacheStorage`: one directory per bucket under the cache directory
//!
//! `BucketState` tracks the lifecycle of a bucket across deployments.

pub mod disk;
pub mod memory;
pub mod state;
pub mod storage;

pub use disk::DiskCacheStorage;
pub use memory::MemoryCacheStorage;
pub use state::{BucketState, BucketStates};
pub use storage::{CacheBucket, CacheStorage};
