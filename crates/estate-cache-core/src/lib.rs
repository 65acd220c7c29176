//! Core library for the estate-tools offline cache.
//!
//! The `CachePolicyController` owns one version-tagged cache bucket:
//! it fills the bucket from a fixed asset manifest on install, purges older
//! buckets on activate, and answers intercepted requests network-first for
//! `/api/` paths and cache-first for everything else.
//!
//! The host runtime is abstracted behind `CacheStorage` / `CacheBucket`
//! (persistent named buckets) and `Fetcher` (the network), so the same
//! controller runs against the on-disk store, the in-memory store in tests,
//! or any other host.

pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod host;
pub mod models;
pub mod network;

pub use cache::{BucketState, CacheBucket, CacheStorage, DiskCacheStorage, MemoryCacheStorage};
pub use config::{Config, API_PREFIX, CACHE_NAME, STATIC_ASSETS};
pub use controller::{ActivateOutcome, CachePolicyController, InstallOutcome, Strategy};
pub use error::{CacheError, ControllerError, FetchError};
pub use host::{ClientId, DeployReport, HostError, ServiceWorkerHost, WorkerInfo, WorkerState};
pub use models::{CachedEntry, Request, RequestKey, Response, ResponseSource, ServedResponse};
pub use network::{Fetcher, HttpFetcher};
