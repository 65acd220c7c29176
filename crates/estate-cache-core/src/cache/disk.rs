//! On-disk bucket store.
//!
//! ```text
//! ~/.cache/estate-tools/{bucket}/
//!   {sha256 of request key}.json   # request, response head, cached_at
//!   {sha256 of request key}.body   # raw response body
//! ```
//!
//! Bulk writes go to a `.staging-*` directory first and are moved into the
//! bucket only after every entry was written.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::storage::{validate_bucket_name, CacheBucket, CacheStorage};
use crate::error::CacheError;
use crate::models::{CachedEntry, Request, RequestKey, Response};

const META_EXT: &str = "json";
const BODY_EXT: &str = "body";
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct DiskCacheStorage {
    root: PathBuf,
    // Held for writing while a bulk write moves files into place
    lock: Arc<RwLock<()>>,
}

impl DiskCacheStorage {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            lock: Arc::new(RwLock::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    type Bucket = DiskBucket;

    async fn open(&self, name: &str) -> Result<DiskBucket, CacheError> {
        validate_bucket_name(name)?;
        let dir = self.bucket_path(name);
        fs::create_dir_all(&dir).await?;
        Ok(DiskBucket {
            name: name.to_string(),
            dir,
            lock: self.lock.clone(),
        })
    }

    async fn has(&self, name: &str) -> Result<bool, CacheError> {
        validate_bucket_name(name)?;
        Ok(fs::try_exists(self.bucket_path(name)).await?)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        validate_bucket_name(name)?;
        let _guard = self.lock.write().await;
        let dir = self.bucket_path(name);
        if !fs::try_exists(&dir).await? {
            return Ok(false);
        }
        fs::remove_dir_all(&dir).await?;
        debug!(bucket = name, "Deleted bucket directory");
        Ok(true)
    }
}

/// Writes through a handle whose bucket was deleted fail with `CacheError::Io`.
#[derive(Debug, Clone)]
pub struct DiskBucket {
    name: String,
    dir: PathBuf,
    lock: Arc<RwLock<()>>,
}

fn entry_stem(key: &RequestKey) -> String {
    hex::encode(Sha256::digest(key.to_string().as_bytes()))
}

async fn write_entry(dir: &Path, entry: &CachedEntry) -> Result<String, CacheError> {
    let stem = entry_stem(&entry.key());
    let meta = serde_json::to_vec_pretty(entry)?;
    fs::write(dir.join(format!("{stem}.{META_EXT}")), meta).await?;
    fs::write(dir.join(format!("{stem}.{BODY_EXT}")), &entry.response.body).await?;
    Ok(stem)
}

async fn read_entry(dir: &Path, stem: &str) -> Result<Option<CachedEntry>, CacheError> {
    let meta_path = dir.join(format!("{stem}.{META_EXT}"));
    let meta = match fs::read(&meta_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut entry: CachedEntry = serde_json::from_slice(&meta)?;
    // A head without its body is a miss, not corruption
    entry.response.body = match fs::read(dir.join(format!("{stem}.{BODY_EXT}"))).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(entry))
}

impl DiskBucket {
    async fn stems(&self) -> Result<Vec<String>, CacheError> {
        let mut stems = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
        Ok(stems)
    }

    async fn stage(&self, staging: &Path, entries: &[CachedEntry]) -> Result<Vec<String>, CacheError> {
        fs::create_dir(staging).await?;
        let mut stems = Vec::with_capacity(entries.len());
        for entry in entries {
            // Same key twice: the later write already replaced the staged files
            let stem = write_entry(staging, entry).await?;
            if !stems.contains(&stem) {
                stems.push(stem);
            }
        }
        Ok(stems)
    }

    /// Move staged files into the bucket. Files they replace are parked in
    /// `backup` so a failed move can put everything back.
    async fn commit(
        &self,
        staging: &Path,
        stems: &[String],
        moved: &mut Vec<(String, bool)>,
    ) -> Result<(), CacheError> {
        let backup = staging.join("backup");
        fs::create_dir(&backup).await?;
        for stem in stems {
            for ext in [META_EXT, BODY_EXT] {
                let file = format!("{stem}.{ext}");
                let target = self.dir.join(&file);
                let replaced = match fs::metadata(&target).await {
                    Ok(meta) if meta.is_file() => {
                        fs::rename(&target, backup.join(&file)).await?;
                        true
                    }
                    _ => false,
                };
                if let Err(e) = fs::rename(staging.join(&file), &target).await {
                    if replaced {
                        moved.push((file, true));
                    }
                    return Err(e.into());
                }
                moved.push((file, replaced));
            }
        }
        Ok(())
    }

    async fn rollback(&self, staging: &Path, moved: &[(String, bool)]) {
        let backup = staging.join("backup");
        for (file, replaced) in moved.iter().rev() {
            let target = self.dir.join(file);
            let restored = if *replaced {
                fs::rename(backup.join(file), &target).await
            } else {
                fs::remove_file(&target).await
            };
            if let Err(e) = restored {
                warn!(bucket = %self.name, file = %file, error = %e, "Failed to roll back cache file");
            }
        }
    }
}

#[async_trait]
impl CacheBucket for DiskBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let _guard = self.lock.read().await;
        let entry = read_entry(&self.dir, &entry_stem(&request.key())).await?;
        Ok(entry.map(|e| e.response))
    }

    async fn put(&self, request: Request, response: Response) -> Result<(), CacheError> {
        self.put_all(vec![(request, response)]).await
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        let entries: Vec<CachedEntry> = entries
            .into_iter()
            .map(|(request, response)| CachedEntry::new(request, response))
            .collect();

        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let staging = self.dir.join(format!("{STAGING_PREFIX}{nanos}"));

        let stems = match self.stage(&staging, &entries).await {
            Ok(stems) => stems,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging).await {
                    warn!(bucket = %self.name, error = %cleanup, "Failed to remove staging directory");
                }
                return Err(e);
            }
        };

        let _guard = self.lock.write().await;
        let mut moved = Vec::new();
        let committed = self.commit(&staging, &stems, &mut moved).await;
        if committed.is_err() {
            self.rollback(&staging, &moved).await;
        }
        if let Err(cleanup) = fs::remove_dir_all(&staging).await {
            warn!(bucket = %self.name, error = %cleanup, "Failed to remove staging directory");
        }
        committed?;
        debug!(bucket = %self.name, count = stems.len(), "Stored entries");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError> {
        let mut keys: Vec<RequestKey> = self.entries().await?.iter().map(|e| e.key()).collect();
        keys.sort();
        Ok(keys)
    }

    async fn entries(&self) -> Result<Vec<CachedEntry>, CacheError> {
        let _guard = self.lock.read().await;
        let mut entries = Vec::new();
        for stem in self.stems().await? {
            if let Some(entry) = read_entry(&self.dir, &stem).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(entries)
    }
}
