use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::job::{JobId, JobOutcome, JobParams, TrainingJob};
use crate::core::registry::ModelVersion;

/// A sample row exactly as the capture side stored it. Landmarks are kept raw
/// so that a malformed row can be dropped by the preprocessor instead of
/// failing the whole page.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RawSample {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub landmarks: Value,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Returns at most `limit` rows starting at `offset`, in a stable order.
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<RawSample>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Oldest `pending` job by creation time, ties broken by id.
    async fn oldest_pending(&self) -> Result<Option<TrainingJob>>;

    /// Conditional `pending -> running` transition. Returns the number of rows
    /// affected: 1 when this caller won the claim, 0 when someone else did.
    async fn claim(&self, id: JobId, started_at: DateTime<Utc>) -> Result<u64>;

    /// Terminal transition of a job this caller still holds: `running` and
    /// stamped with the caller's `claimed_at`. Returns the rows affected.
    async fn finish(
        &self,
        id: JobId,
        claimed_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: &JobOutcome,
    ) -> Result<u64>;

    async fn enqueue(&self, params: &JobParams) -> Result<TrainingJob>;

    async fn get(&self, id: JobId) -> Result<Option<TrainingJob>>;

    /// Moves `running` jobs started before `cutoff` back to `pending`.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Writes `bytes` at `key` (`<version>/<filename>`). Overwrites an existing
    /// object at the same key so a retried upload is idempotent.
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;

    /// Writes `bytes` at `key` only if nothing is stored there yet. Returns
    /// `false` without touching the existing object when the key is taken.
    async fn create(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<bool>;

    fn public_uri(&self, key: &str) -> String;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    async fn insert(&self, record: &ModelVersion) -> Result<()>;

    /// Newest first.
    async fn list(&self, limit: usize) -> Result<Vec<ModelVersion>>;
}
