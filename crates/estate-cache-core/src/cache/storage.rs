use async_trait::async_trait;

use crate::error::CacheError;
use crate::models::{CachedEntry, Request, RequestKey, Response};

/// The named bucket store provided by the host.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    type Bucket: CacheBucket;

    /// Open a bucket, creating it if absent.
    async fn open(&self, name: &str) -> Result<Self::Bucket, CacheError>;

    async fn has(&self, name: &str) -> Result<bool, CacheError>;

    /// Names of every existing bucket.
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete a bucket. Returns false if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, CacheError>;
}

/// One bucket. Handles stay usable after the bucket is deleted from storage,
/// but writes through them are no longer visible to `CacheStorage::open`.
#[async_trait]
pub trait CacheBucket: Send + Sync {
    fn name(&self) -> &str;

    /// Stored response for the request's identity, if any.
    async fn match_request(&self, request: &Request) -> Result<Option<Response>, CacheError>;

    async fn put(&self, request: Request, response: Response) -> Result<(), CacheError>;

    /// Store every pair or none of them.
    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError>;

    async fn keys(&self) -> Result<Vec<RequestKey>, CacheError>;

    async fn entries(&self) -> Result<Vec<CachedEntry>, CacheError>;
}

/// Reject names that cannot be used as a single path component.
pub(crate) fn validate_bucket_name(name: &str) -> Result<(), CacheError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(CacheError::InvalidBucketName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bucket_name() {
        assert!(validate_bucket_name("estate-tools-v2").is_ok());
        assert!(validate_bucket_name("").is_err());
        assert!(validate_bucket_name("..").is_err());
        assert!(validate_bucket_name(".staging").is_err());
        assert!(validate_bucket_name("a/b").is_err());
    }
}
