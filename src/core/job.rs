use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type JobId = i64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }
}

/// A row of the job queue as stored in the shared store.
///
/// `params` and `result` stay as raw JSON on the row; they are only turned into
/// [`JobParams`] / [`JobResult`] at the worker boundary.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrainingJob {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TrainParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_epochs: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    TrainGesture(TrainParams),
}

impl Default for JobParams {
    fn default() -> Self {
        JobParams::TrainGesture(TrainParams::default())
    }
}

impl JobParams {
    /// Validates the opaque `params` column. Rows written by older tooling carry
    /// `null` or `{}`, both of which mean a default training run.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(JobParams::default()),
            Value::Object(map) if map.is_empty() => Ok(JobParams::default()),
            Value::Object(_) => serde_json::from_value(value.clone())
                .with_context(|| format!("Invalid job params: {}", value)),
            other => bail!("Job params must be an object, got: {}", other),
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing a derived enum of plain fields cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrainedSummary {
    pub ok: bool,
    pub version: String,
    pub accuracy: f64,
    pub loss: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub classes: Vec<String>,
    pub samples: usize,
    pub epochs_run: usize,
    pub artifact_uri: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SkippedSummary {
    pub ok: bool,
    pub reason: String,
    pub samples: usize,
}

/// Outcome of a pipeline run that did not raise. A skipped run is still
/// recorded on a `done` job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum JobResult {
    Trained(TrainedSummary),
    Skipped(SkippedSummary),
}

pub const NOT_ENOUGH_SAMPLES: &str = "not_enough_samples";

impl JobResult {
    pub fn not_enough_samples(samples: usize) -> Self {
        JobResult::Skipped(SkippedSummary {
            ok: false,
            reason: NOT_ENOUGH_SAMPLES.to_string(),
            samples,
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, JobResult::Trained(_))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).context("Failed to serialize job result")
    }
}

/// Terminal update written back onto a claimed job.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Done(JobResult),
    Failed(String),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Done(_) => JobStatus::Done,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}
