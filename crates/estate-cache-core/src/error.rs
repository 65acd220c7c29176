use thiserror::Error;

use crate::cache::BucketState;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Bad status {status} for {url}")]
    BadStatus { url: String, status: u16 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Error for a response the install step refuses to store.
    pub fn from_status(url: &str, status: u16) -> Self {
        FetchError::BadStatus {
            url: url.to_string(),
            status,
        }
    }

    /// True for transport failures, false for responses that merely carried a
    /// status the caller did not accept.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Unreachable(_))
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid bucket name: {0:?}")]
    InvalidBucketName(String),

    #[error("Bucket {bucket} cannot move from {from} to {to}")]
    InvalidTransition {
        bucket: String,
        from: BucketState,
        to: BucketState,
    },
}

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("Install failed on {asset}: {source}")]
    Install {
        asset: String,
        #[source]
        source: Box<ControllerError>,
    },

    #[error("Activate failed deleting {bucket}: {source}")]
    Activate {
        bucket: String,
        #[source]
        source: CacheError,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl ControllerError {
    /// Wrap a failure on one manifest asset.
    pub fn install(asset: &str, source: impl Into<ControllerError>) -> Self {
        ControllerError::Install {
            asset: asset.to_string(),
            source: Box::new(source.into()),
        }
    }
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
