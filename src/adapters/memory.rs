use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::store::{ArtifactStore, JobStore, ModelRegistry, RawSample, SampleStore};
use crate::core::job::{JobId, JobOutcome, JobParams, JobStatus, TrainingJob};
use crate::core::registry::ModelVersion;

#[derive(Default)]
struct State {
    samples: Vec<RawSample>,
    jobs: BTreeMap<JobId, TrainingJob>,
    next_id: JobId,
    objects: BTreeMap<String, Vec<u8>>,
    versions: Vec<ModelVersion>,
}

/// In-process store implementing every backend trait. Clones share state, so
/// several workers can race against one queue.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_samples(&self, samples: impl IntoIterator<Item = RawSample>) {
        self.state.lock().await.samples.extend(samples);
    }

    pub async fn jobs(&self) -> Vec<TrainingJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().await.objects.get(key).cloned()
    }

    pub async fn object_keys(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    pub async fn versions(&self) -> Vec<ModelVersion> {
        self.state.lock().await.versions.clone()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<RawSample>> {
        let state = self.state.lock().await;
        Ok(state.samples.iter().skip(offset).take(limit).cloned().collect())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn oldest_pending(&self) -> Result<Option<TrainingJob>> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .min_by_key(|job| (job.created_at, job.id))
            .cloned())
    }

    async fn claim(&self, id: JobId, started_at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Running;
                job.started_at = Some(started_at);
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn finish(
        &self,
        id: JobId,
        claimed_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: &JobOutcome,
    ) -> Result<u64> {
        let result = match outcome {
            JobOutcome::Done(result) => Some(result.to_value()?),
            JobOutcome::Failed(_) => None,
        };
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running && job.started_at == Some(claimed_at) => {
                job.status = outcome.status();
                job.finished_at = Some(finished_at);
                job.result = result;
                if let JobOutcome::Failed(error) = outcome {
                    job.error = Some(error.clone());
                }
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn enqueue(&self, params: &JobParams) -> Result<TrainingJob> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let job = TrainingJob {
            id: state.next_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            params: params.to_value(),
            result: None,
            error: None,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<TrainingJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut state = self.state.lock().await;
        let mut requeued = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running && job.started_at.map_or(true, |t| t < cutoff) {
                job.status = JobStatus::Pending;
                job.started_at = None;
                requeued.push(job.id);
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        self.state.lock().await.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn create(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.objects.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(bytes);
                Ok(true)
            }
        }
    }

    fn public_uri(&self, key: &str) -> String {
        format!("memory://{}", key)
    }
}

#[async_trait]
impl ModelRegistry for MemoryStore {
    async fn insert(&self, record: &ModelVersion) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.versions.iter().any(|v| v.version == record.version) {
            anyhow::bail!("Model version {} already exists", record.version);
        }
        state.versions.push(record.clone());
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ModelVersion>> {
        let state = self.state.lock().await;
        let mut versions = state.versions.clone();
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.version.cmp(&a.version)));
        versions.truncate(limit);
        Ok(versions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobResult;

    #[tokio::test]
    async fn claim_only_succeeds_once() {
        let store = MemoryStore::new();
        let job = store.enqueue(&JobParams::default()).await.unwrap();
        assert_eq!(store.claim(job.id, Utc::now()).await.unwrap(), 1);
        assert_eq!(store.claim(job.id, Utc::now()).await.unwrap(), 0);
        assert!(store.oldest_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oldest_pending_breaks_ties_by_id() {
        let store = MemoryStore::new();
        let first = store.enqueue(&JobParams::default()).await.unwrap();
        let second = store.enqueue(&JobParams::default()).await.unwrap();
        {
            let mut state = store.state.lock().await;
            let created = state.jobs[&first.id].created_at;
            state.jobs.get_mut(&second.id).unwrap().created_at = created;
        }
        assert_eq!(store.oldest_pending().await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn terminal_jobs_are_not_rewritten() {
        let store = MemoryStore::new();
        let job = store.enqueue(&JobParams::default()).await.unwrap();
        let claimed_at = Utc::now();
        store.claim(job.id, claimed_at).await.unwrap();
        let done = JobOutcome::Done(JobResult::not_enough_samples(3));
        assert_eq!(store.finish(job.id, claimed_at, Utc::now(), &done).await.unwrap(), 1);
        let failed = JobOutcome::Failed("late".into());
        assert_eq!(store.finish(job.id, claimed_at, Utc::now(), &failed).await.unwrap(), 0);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn stale_running_jobs_are_requeued() {
        let store = MemoryStore::new();
        let job = store.enqueue(&JobParams::default()).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        store.claim(job.id, long_ago).await.unwrap();
        let requeued = store.requeue_stale(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(requeued, vec![job.id]);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn reaped_claim_cannot_finish_the_new_run() {
        let store = MemoryStore::new();
        let job = store.enqueue(&JobParams::default()).await.unwrap();
        let first_claim = Utc::now() - chrono::Duration::hours(2);
        store.claim(job.id, first_claim).await.unwrap();
        store.requeue_stale(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        let second_claim = Utc::now();
        assert_eq!(store.claim(job.id, second_claim).await.unwrap(), 1);

        let late = JobOutcome::Failed("original run gave up".into());
        assert_eq!(store.finish(job.id, first_claim, Utc::now(), &late).await.unwrap(), 0);
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);

        let done = JobOutcome::Done(JobResult::not_enough_samples(4));
        assert_eq!(store.finish(job.id, second_claim, Utc::now(), &done).await.unwrap(), 1);
        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn create_keeps_existing_objects() {
        let store = MemoryStore::new();
        assert!(store.create("v1/labels.json", b"[\"A\"]".to_vec(), "application/json").await.unwrap());
        assert!(!store.create("v1/labels.json", b"[\"X\"]".to_vec(), "application/json").await.unwrap());
        assert_eq!(store.object("v1/labels.json").await.unwrap(), b"[\"A\"]".to_vec());
    }

    #[tokio::test]
    async fn samples_are_paged() {
        let store = MemoryStore::new();
        store.add_samples((0..5).map(|_| RawSample::default())).await;
        assert_eq!(store.fetch_page(0, 2).await.unwrap().len(), 2);
        assert_eq!(store.fetch_page(4, 2).await.unwrap().len(), 1);
        assert!(store.fetch_page(5, 2).await.unwrap().is_empty());
    }
}
