use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CacheError;

/// Lifecycle of one bucket across deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketState {
    Absent,
    Populating,
    Current,
    Stale,
    Deleted,
}

impl BucketState {
    pub fn can_transition_to(self, next: BucketState) -> bool {
        use BucketState::*;
        matches!(
            (self, next),
            (Absent, Populating)
                | (Populating, Current)
                // failed population reverts
                | (Populating, Absent)
                // re-install of the same version
                | (Current, Populating)
                | (Current, Stale)
                | (Stale, Deleted)
                // a bucket found during activation was never tracked here
                | (Absent, Stale)
        )
    }
}

impl fmt::Display for BucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BucketState::Absent => "absent",
            BucketState::Populating => "populating",
            BucketState::Current => "current",
            BucketState::Stale => "stale",
            BucketState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// States of every bucket a controller has seen. Untracked buckets are `Absent`.
#[derive(Debug, Default)]
pub struct BucketStates {
    states: Mutex<HashMap<String, BucketState>>,
}

impl BucketStates {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, bucket: &str) -> BucketState {
        self.states
            .lock()
            .await
            .get(bucket)
            .copied()
            .unwrap_or(BucketState::Absent)
    }

    /// Move a bucket to `next`, returning the state it left.
    pub async fn transition(
        &self,
        bucket: &str,
        next: BucketState,
    ) -> Result<BucketState, CacheError> {
        let mut states = self.states.lock().await;
        let from = states.get(bucket).copied().unwrap_or(BucketState::Absent);
        if !from.can_transition_to(next) {
            return Err(CacheError::InvalidTransition {
                bucket: bucket.to_string(),
                from,
                to: next,
            });
        }
        debug!(bucket, %from, to = %next, "Bucket state change");
        states.insert(bucket.to_string(), next);
        Ok(from)
    }

    /// Put a bucket back where it was after a failed step.
    pub(crate) async fn restore(&self, bucket: &str, state: BucketState) {
        self.states.lock().await.insert(bucket.to_string(), state);
    }
}
