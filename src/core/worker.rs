use anyhow::Result;
use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::adapters::store::JobStore;
use crate::core::job::{JobId, JobOutcome, JobParams, JobStatus, TrainingJob};
use crate::core::pipeline::TrainingPipeline;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    /// When set, `running` jobs older than this are put back in the queue.
    pub lease: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(5), lease: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing pending.
    Idle,
    /// Another worker claimed the candidate first.
    Lost(JobId),
    Processed(JobId, JobStatus),
}

/// Single-job-at-a-time queue consumer. Several workers may share one store;
/// the conditional claim keeps each job to one of them.
pub struct Worker {
    id: Uuid,
    jobs: Arc<dyn JobStore>,
    pipeline: TrainingPipeline,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(jobs: Arc<dyn JobStore>, pipeline: TrainingPipeline, config: WorkerConfig) -> Self {
        Self { id: Uuid::new_v4(), jobs, pipeline, config }
    }

    /// One poll/claim/run cycle. Errors are store errors from polling or
    /// claiming; pipeline failures are recorded on the job instead.
    pub async fn run_once(&self) -> Result<Cycle> {
        let Some(job) = self.jobs.oldest_pending().await? else {
            return Ok(Cycle::Idle);
        };

        let claimed_at = Utc::now();
        if self.jobs.claim(job.id, claimed_at).await? == 0 {
            info!("Worker {}: job {} was claimed by another worker", self.id, job.id);
            return Ok(Cycle::Lost(job.id));
        }
        info!("Worker {} claimed job {}", self.id, job.id);

        let outcome = self.execute(&job).await;
        let status = outcome.status();
        let updated = self.jobs.finish(job.id, claimed_at, Utc::now(), &outcome).await?;
        if updated == 0 {
            warn!("Worker {} no longer held job {}; its {} status was dropped", self.id, job.id, status.as_str());
        } else {
            info!("Job {} finished as {}", job.id, status.as_str());
        }
        Ok(Cycle::Processed(job.id, status))
    }

    async fn execute(&self, job: &TrainingJob) -> JobOutcome {
        let run = async {
            let params = JobParams::from_value(&job.params)?;
            self.pipeline.run(&params).await
        };
        match run.await {
            Ok(result) => {
                if !result.is_ok() {
                    warn!("Job {} completed without training a model", job.id);
                }
                JobOutcome::Done(result)
            }
            Err(e) => {
                error!("Job {} failed: {:#}", job.id, e);
                JobOutcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn reap_stale(&self) {
        let Some(lease) = self.config.lease else { return };
        let Ok(lease) = chrono::Duration::from_std(lease) else { return };
        match self.jobs.requeue_stale(Utc::now() - lease).await {
            Ok(ids) if !ids.is_empty() => warn!("Requeued {} jobs with expired leases", ids.len()),
            Ok(_) => {}
            Err(e) => warn!("Failed to requeue stale jobs: {:#}", e),
        }
    }

    /// Polls forever. Returns once `shutdown` resolves while the worker is idle.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Worker {} started, polling every {:?}", self.id, self.config.poll_interval);
        loop {
            match self.run_once().await {
                Ok(Cycle::Processed(..)) | Ok(Cycle::Lost(_)) => continue,
                Ok(Cycle::Idle) => self.reap_stale().await,
                Err(e) => warn!("Polling the job queue failed: {:#}", e),
            }
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, worker stopping");
                    return;
                }
            }
        }
    }

    pub async fn run(&self) {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        }).await
    }
}
