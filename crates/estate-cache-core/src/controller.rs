//! The cache policy controller.
//!
//! Three handlers, one per host lifecycle event:
//! - `install`: store every manifest asset in the version's bucket, all or nothing
//! - `activate`: delete every bucket that is not the version's bucket
//! - `handle_fetch`: network-first for API paths, cache-first for everything else
//!
//! The bucket is written only by `install`. Fetch handling only reads it, so
//! any number of `handle_fetch` calls may run at once.

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{BucketState, BucketStates, CacheBucket, CacheStorage};
use crate::config::Config;
use crate::error::{ControllerError, FetchError, Result};
use crate::models::{Request, Response, ServedResponse};
use crate::network::Fetcher;

/// Which source a request consults first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Network, then the bucket if the network failed.
    NetworkFirst,
    /// Bucket, then the network on a miss.
    CacheFirst,
}

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub cache_name: String,
    pub stored: usize,
    /// Activate as soon as install succeeds instead of waiting for old clients to close.
    pub skip_waiting: bool,
}

/// Result of a successful activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    pub cache_name: String,
    pub deleted: Vec<String>,
    /// Take control of every open client without a reload.
    pub claim_clients: bool,
}

pub struct CachePolicyController<S, F> {
    config: Config,
    storage: Arc<S>,
    fetcher: Arc<F>,
    states: BucketStates,
}

impl<S, F> CachePolicyController<S, F>
where
    S: CacheStorage,
    F: Fetcher,
{
    pub fn new(config: Config, storage: Arc<S>, fetcher: Arc<F>) -> Self {
        Self {
            config,
            storage,
            fetcher,
            states: BucketStates::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    pub async fn bucket_state(&self, bucket: &str) -> BucketState {
        self.states.get(bucket).await
    }

    // ===== Install =====

    pub async fn install(&self) -> Result<InstallOutcome> {
        let name = self.config.cache_name.clone();
        let urls = self.config.manifest_urls()?;
        info!(cache = %name, assets = urls.len(), "Installing");

        let previous = self.states.transition(&name, BucketState::Populating).await?;
        match self.populate(urls).await {
            Ok(stored) => {
                self.states.transition(&name, BucketState::Current).await?;
                info!(cache = %name, stored, "Install complete");
                Ok(InstallOutcome {
                    cache_name: name,
                    stored,
                    skip_waiting: self.config.skip_waiting,
                })
            }
            Err(e) => {
                self.states.restore(&name, previous).await;
                warn!(cache = %name, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    /// Fetch the whole manifest, then write it in one bulk call.
    async fn populate(&self, urls: Vec<Url>) -> Result<usize> {
        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            let asset = request.url.to_string();
            let response = self
                .fetcher
                .fetch(&request)
                .await
                .map_err(|e| ControllerError::install(&asset, e))?;
            if !response.ok() {
                return Err(ControllerError::install(
                    &asset,
                    FetchError::from_status(&asset, response.status),
                ));
            }
            debug!(asset = %asset, status = response.status, "Fetched manifest asset");
            Ok((request, response))
        });
        let entries = try_join_all(fetches).await?;
        let stored = entries.len();

        let name = &self.config.cache_name;
        let existed = self.storage.has(name).await?;
        let bucket = self.storage.open(name).await?;
        if let Err(e) = bucket.put_all(entries).await {
            // Opening created the bucket; a failed write must not leave it behind
            if !existed {
                if let Err(cleanup) = self.storage.delete(name).await {
                    warn!(cache = %name, error = %cleanup, "Failed to remove bucket after failed install");
                }
            }
            return Err(e.into());
        }
        Ok(stored)
    }

    // ===== Activate =====

    pub async fn activate(&self) -> Result<ActivateOutcome> {
        let current = self.config.cache_name.clone();
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| *name != current)
            .collect();

        for name in &stale {
            self.mark(name, BucketState::Stale).await;
        }

        // Every deletion settles before the first failure is reported
        let results = join_all(stale.iter().map(|name| async move {
            self.storage
                .delete(name)
                .await
                .map_err(|source| ControllerError::Activate {
                    bucket: name.clone(),
                    source,
                })?;
            self.mark(name, BucketState::Deleted).await;
            Ok::<_, ControllerError>(name.clone())
        }))
        .await;

        let mut deleted = Vec::with_capacity(results.len());
        for result in results {
            deleted.push(result?);
        }

        info!(cache = %current, deleted = ?deleted, "Activated");
        Ok(ActivateOutcome {
            cache_name: current,
            deleted,
            claim_clients: true,
        })
    }

    async fn mark(&self, bucket: &str, state: BucketState) {
        if let Err(e) = self.states.transition(bucket, state).await {
            warn!(error = %e, "Unexpected bucket state change");
            self.states.restore(bucket, state).await;
        }
    }

    // ===== Fetch =====

    pub fn strategy_for(&self, request: &Request) -> Strategy {
        if request.path().starts_with(&self.config.api_prefix) {
            Strategy::NetworkFirst
        } else {
            Strategy::CacheFirst
        }
    }

    pub async fn handle_fetch(&self, request: &Request) -> Result<ServedResponse> {
        match self.strategy_for(request) {
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
        }
    }

    async fn network_first(&self, request: &Request) -> Result<ServedResponse> {
        match self.fetcher.fetch(request).await {
            Ok(response) => Ok(ServedResponse::from_network(response)),
            Err(err) => {
                warn!(url = %request.url, error = %err, "Network failed, trying cache");
                match self.lookup(request).await {
                    Ok(Some(response)) => Ok(ServedResponse::from_cache(response)),
                    Ok(None) => Err(err.into()),
                    Err(cache_err) => {
                        // The network failure is the one the caller needs to see
                        warn!(url = %request.url, error = %cache_err, "Cache fallback failed");
                        Err(err.into())
                    }
                }
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<ServedResponse> {
        if let Some(response) = self.lookup(request).await? {
            return Ok(ServedResponse::from_cache(response));
        }
        // Misses are not written back; the manifest alone fills the bucket
        let response = self.fetcher.fetch(request).await?;
        Ok(ServedResponse::from_network(response))
    }

    /// Read-only lookup in the current bucket. Never creates the bucket.
    async fn lookup(&self, request: &Request) -> Result<Option<Response>> {
        let name = &self.config.cache_name;
        if !self.storage.has(name).await? {
            debug!(cache = %name, url = %request.url, "No bucket");
            return Ok(None);
        }
        let hit = self.storage.open(name).await?.match_request(request).await?;
        debug!(cache = %name, url = %request.url, hit = hit.is_some(), "Cache lookup");
        Ok(hit)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::config::STATIC_ASSETS;
    use crate::error::CacheError;
    use crate::models::ResponseSource;

    type Controller = CachePolicyController<MemoryCacheStorage, FakeNetwork>;

    fn controller(network: FakeNetwork) -> (Arc<MemoryCacheStorage>, Arc<FakeNetwork>, Controller) {
        let storage = Arc::new(MemoryCacheStorage::new());
        let network = Arc::new(network);
        let controller = CachePolicyController::new(Config::default(), storage.clone(), network.clone());
        (storage, network, controller)
    }

    fn faulty_controller(
        storage: FaultyStorage,
        network: FakeNetwork,
    ) -> (
        Arc<FaultyStorage>,
        Arc<FakeNetwork>,
        CachePolicyController<FaultyStorage, FakeNetwork>,
    ) {
        let storage = Arc::new(storage);
        let network = Arc::new(network);
        let controller = CachePolicyController::new(Config::default(), storage.clone(), network.clone());
        (storage, network, controller)
    }

    fn get(path: &str) -> Request {
        Request::get(Config::default().resolve(path).unwrap())
    }

    async fn seed(storage: &MemoryCacheStorage, bucket: &str, path: &str, body: &str) {
        let request = get(path);
        let response = Response::new(&request.url, 200, body);
        storage.open(bucket).await.unwrap().put(request, response).await.unwrap();
    }

    // ===== Install =====

    #[tokio::test]
    async fn test_install_stores_every_manifest_asset() {
        let (storage, _network, controller) = controller(manifest_network());

        let outcome = controller.install().await.unwrap();
        assert_eq!(outcome.cache_name, "estate-tools-v2");
        assert_eq!(outcome.stored, STATIC_ASSETS.len());
        assert!(outcome.skip_waiting);

        let bucket = storage.open("estate-tools-v2").await.unwrap();
        let mut keys: Vec<String> = bucket.keys().await.unwrap().into_iter().map(|k| k.url).collect();
        keys.sort();
        let mut expected: Vec<String> = Config::default()
            .manifest_urls()
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        expected.sort();
        assert_eq!(keys, expected);
        assert_eq!(
            controller.bucket_state("estate-tools-v2").await,
            BucketState::Current
        );
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let (storage, _network, controller) = controller(manifest_network());
        controller.install().await.unwrap();
        let first = storage.open("estate-tools-v2").await.unwrap().keys().await.unwrap();

        controller.install().await.unwrap();
        let second = storage.open("estate-tools-v2").await.unwrap().keys().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_install_fails_atomically_on_network_error() {
        let network = FakeNetwork::new()
            .route("http://localhost:5000/", 200, "root")
            .route("http://localhost:5000/static/index.html", 200, "index")
            .route("http://localhost:5000/static/logo.jpg", 200, "jpeg")
            .route(FONT_URL, 200, "font");
        let (storage, _network, controller) = controller(network);

        let err = controller.install().await.unwrap_err();
        match err {
            ControllerError::Install { asset, .. } => assert_eq!(asset, CHART_URL),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!storage.has("estate-tools-v2").await.unwrap());
        assert_eq!(
            controller.bucket_state("estate-tools-v2").await,
            BucketState::Absent
        );
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let network = manifest_network().route("http://localhost:5000/static/logo.jpg", 404, "missing");
        let (storage, _network, controller) = controller(network);

        let err = controller.install().await.unwrap_err();
        assert!(err.to_string().contains("Bad status 404"));
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_reinstall_keeps_current_bucket() {
        let (storage, network, controller) = controller(manifest_network());
        controller.install().await.unwrap();

        network.set_offline(true);
        assert!(controller.install().await.is_err());
        assert_eq!(
            controller.bucket_state("estate-tools-v2").await,
            BucketState::Current
        );
        let bucket = storage.open("estate-tools-v2").await.unwrap();
        assert_eq!(bucket.keys().await.unwrap().len(), STATIC_ASSETS.len());
    }

    #[tokio::test]
    async fn test_failed_write_removes_new_bucket() {
        let (storage, _network, controller) =
            faulty_controller(FaultyStorage::new().failing_put_all(), manifest_network());

        let err = controller.install().await.unwrap_err();
        assert!(matches!(err, ControllerError::Cache(CacheError::Io(_))));
        assert!(!storage.has("estate-tools-v2").await.unwrap());
        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(
            controller.bucket_state("estate-tools-v2").await,
            BucketState::Absent
        );
    }

    #[tokio::test]
    async fn test_failed_write_keeps_existing_bucket() {
        let storage = FaultyStorage::new().failing_put_all();
        let request = get("/static/index.html");
        storage
            .inner
            .open("estate-tools-v2")
            .await
            .unwrap()
            .put(request.clone(), Response::new(&request.url, 200, "old"))
            .await
            .unwrap();
        let (storage, _network, controller) = faulty_controller(storage, manifest_network());

        assert!(controller.install().await.is_err());
        let bucket = storage.inner.open("estate-tools-v2").await.unwrap();
        let hit = bucket.match_request(&request).await.unwrap().unwrap();
        assert_eq!(hit.body, b"old");
    }

    // ===== Activate =====

    #[tokio::test]
    async fn test_activate_purges_stale_buckets() {
        let (storage, _network, controller) = controller(manifest_network());
        seed(&storage, "estate-tools-v1", "/static/index.html", "old").await;

        controller.install().await.unwrap();
        let outcome = controller.activate().await.unwrap();

        assert_eq!(outcome.deleted, vec!["estate-tools-v1".to_string()]);
        assert!(outcome.claim_clients);
        assert_eq!(storage.keys().await.unwrap(), vec!["estate-tools-v2".to_string()]);
        assert_eq!(
            controller.bucket_state("estate-tools-v1").await,
            BucketState::Deleted
        );
        assert_eq!(
            controller.bucket_state("estate-tools-v2").await,
            BucketState::Current
        );
    }

    #[tokio::test]
    async fn test_activate_deletes_many_buckets() {
        let (storage, _network, controller) = controller(manifest_network());
        for name in ["estate-tools-v0", "estate-tools-v1", "other-app"] {
            storage.open(name).await.unwrap();
        }
        controller.install().await.unwrap();

        let mut deleted = controller.activate().await.unwrap().deleted;
        deleted.sort();
        assert_eq!(deleted, vec!["estate-tools-v0", "estate-tools-v1", "other-app"]);
        assert_eq!(storage.keys().await.unwrap(), vec!["estate-tools-v2".to_string()]);

        // Nothing left to purge on a second run
        assert!(controller.activate().await.unwrap().deleted.is_empty());
    }

    #[tokio::test]
    async fn test_activate_reports_failed_deletion_after_others_settle() {
        let storage = FaultyStorage::new().failing_delete("estate-tools-v1");
        for name in ["estate-tools-v0", "estate-tools-v1", "other-app"] {
            storage.inner.open(name).await.unwrap();
        }
        let (storage, _network, controller) = faulty_controller(storage, manifest_network());
        controller.install().await.unwrap();

        let err = controller.activate().await.unwrap_err();
        match err {
            ControllerError::Activate { bucket, .. } => assert_eq!(bucket, "estate-tools-v1"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            storage.keys().await.unwrap(),
            vec!["estate-tools-v1".to_string(), "estate-tools-v2".to_string()]
        );
        assert_eq!(
            controller.bucket_state("estate-tools-v0").await,
            BucketState::Deleted
        );
        assert_eq!(
            controller.bucket_state("estate-tools-v1").await,
            BucketState::Stale
        );
    }

    // ===== Fetch: network-first =====

    #[tokio::test]
    async fn test_api_uses_network_when_reachable() {
        let network = manifest_network().route("http://localhost:5000/api/listings", 200, "fresh");
        let (storage, _network, controller) = controller(network);
        seed(&storage, "estate-tools-v2", "/api/listings", "stale").await;

        let request = get("/api/listings");
        assert_eq!(controller.strategy_for(&request), Strategy::NetworkFirst);
        let served = controller.handle_fetch(&request).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(served.response.body, b"fresh");
    }

    #[tokio::test]
    async fn test_api_error_status_is_not_a_fallback() {
        let network = FakeNetwork::new().route("http://localhost:5000/api/check-auth", 401, "denied");
        let (storage, _network, controller) = controller(network);
        seed(&storage, "estate-tools-v2", "/api/check-auth", "cached").await;

        let served = controller.handle_fetch(&get("/api/check-auth")).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(served.response.status, 401);
    }

    #[tokio::test]
    async fn test_api_falls_back_to_cache_when_offline() {
        let (storage, network, controller) = controller(FakeNetwork::new());
        seed(&storage, "estate-tools-v2", "/api/listings", "cached listings").await;
        network.set_offline(true);

        let served = controller.handle_fetch(&get("/api/listings")).await.unwrap();
        assert!(served.is_from_cache());
        assert_eq!(served.response.body, b"cached listings");
        assert_eq!(network.calls(), vec!["http://localhost:5000/api/listings".to_string()]);
    }

    #[tokio::test]
    async fn test_api_fails_when_offline_and_uncached() {
        let (storage, network, controller) = controller(FakeNetwork::new());
        network.set_offline(true);

        let err = controller.handle_fetch(&get("/api/listings")).await.unwrap_err();
        assert!(matches!(err, ControllerError::Fetch(FetchError::Unreachable(_))));
        // The lookup must not create the bucket
        assert!(storage.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_api_keeps_network_error_when_cache_read_fails() {
        let (_storage, network, controller) =
            faulty_controller(FaultyStorage::new().failing_reads(), FakeNetwork::new());
        network.set_offline(true);

        let err = controller.handle_fetch(&get("/api/listings")).await.unwrap_err();
        assert!(matches!(err, ControllerError::Fetch(FetchError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_api_post_never_matches_cached_get() {
        let (storage, network, controller) = controller(FakeNetwork::new());
        seed(&storage, "estate-tools-v2", "/api/contracts", "[]").await;
        network.set_offline(true);

        let post = Request::new("POST", get("/api/contracts").url);
        assert!(controller.handle_fetch(&post).await.is_err());
    }

    // ===== Fetch: cache-first =====

    #[tokio::test]
    async fn test_static_hit_skips_network() {
        let (_storage, network, controller) = controller(manifest_network());
        controller.install().await.unwrap();
        let installs = network.calls().len();

        let request = get("/static/logo.jpg");
        assert_eq!(controller.strategy_for(&request), Strategy::CacheFirst);
        let served = controller.handle_fetch(&request).await.unwrap();
        assert!(served.is_from_cache());
        assert_eq!(served.response.body, b"jpeg");
        assert_eq!(network.calls().len(), installs);
    }

    #[tokio::test]
    async fn test_static_miss_goes_to_network_without_write_back() {
        let network = FakeNetwork::new().route("http://localhost:5000/static/app.js", 200, "js");
        let (storage, network, controller) = controller(network);

        let request = get("/static/app.js");
        let served = controller.handle_fetch(&request).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(served.response.body, b"js");
        assert_eq!(network.calls().len(), 1);
        assert!(!storage.has("estate-tools-v2").await.unwrap());

        controller.handle_fetch(&request).await.unwrap();
        assert_eq!(network.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_static_miss_offline_fails() {
        let (_storage, network, controller) = controller(FakeNetwork::new());
        network.set_offline(true);
        let err = controller.handle_fetch(&get("/static/app.js")).await.unwrap_err();
        assert!(matches!(err, ControllerError::Fetch(_)));
    }

    #[tokio::test]
    async fn test_routing_uses_path_only() {
        let (_storage, _network, controller) = controller(FakeNetwork::new());
        let cross_origin = Request::get(Url::parse("https://example.com/api/v1/rates").unwrap());
        assert_eq!(controller.strategy_for(&cross_origin), Strategy::NetworkFirst);
        assert_eq!(controller.strategy_for(&get("/api")), Strategy::CacheFirst);
        assert_eq!(controller.strategy_for(&get("/static/api/x")), Strategy::CacheFirst);
        assert_eq!(controller.strategy_for(&get("/?page=/api/")), Strategy::CacheFirst);
    }

    #[tokio::test]
    async fn test_only_current_bucket_is_consulted() {
        let (storage, network, controller) = controller(FakeNetwork::new());
        seed(&storage, "estate-tools-v1", "/static/index.html", "old").await;
        network.set_offline(true);

        assert!(controller.handle_fetch(&get("/static/index.html")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_bucket() {
        let network = manifest_network().route("http://localhost:5000/api/summary", 200, "{}");
        let (_storage, _network, controller) = controller(network);
        controller.install().await.unwrap();

        let requests = [get("/static/index.html"), get("/api/summary"), get("/")];
        let served = join_all(requests.iter().map(|r| controller.handle_fetch(r))).await;
        let sources: Vec<ResponseSource> = served.into_iter().map(|s| s.unwrap().source).collect();
        assert_eq!(
            sources,
            vec![ResponseSource::Cache, ResponseSource::Network, ResponseSource::Cache]
        );
    }
}
