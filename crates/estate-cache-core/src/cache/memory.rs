use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::storage::{validate_bucket_name, CacheBucket, CacheStorage};
use crate::error::CacheError;
use crate::models::{CachedEntry, Request, RequestKey, Response};

type Entries = Arc<RwLock<BTreeMap<RequestKey, CachedEntry>>>;

/// In-process bucket store. Clone is cheap and shares the buckets.
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStorage {
    buckets: Arc<RwLock<HashMap<String, Entries>>>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    type Bucket = MemoryBucket;

    async fn open(&self, name: &str) -> Result<MemoryBucket, CacheError> {
        validate_bucket_name(name)?;
        let mut buckets = self.buckets.write().await;
        let entries = buckets.entry(name.to_string()).or_default().clone();
        Ok(MemoryBucket {
            name: name.to_string(),
            entries,
        })
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.buckets.read().await.contains_key(name))
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names: Vec<String> = self.buckets.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        Ok(self.buckets.write().await.remove(name).is_some())
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBucket {
    name: String,
    entries: Entries,
}

#[async_trait]
impl CacheBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&request.key())
            .map(|entry| entry.response.clone()))
    }

    async fn put(&self, request: Request, response: Response) -> Result<(), CacheError> {
        let entry = CachedEntry::new(request, response);
        self.entries.write().await.insert(entry.key(), entry);
        Ok(())
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        let mut map = self.entries.write().await;
        for (request, response) in entries {
            let entry = CachedEntry::new(request, response);
            map.insert(entry.key(), entry);
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn entries(&self) -> Result<Vec<CachedEntry>, CacheError> {
        Ok(self.entries.read().await.values().cloned().collect())
    }
}
