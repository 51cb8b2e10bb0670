use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::env;
use tokio::time::Duration;

use super::store::{ArtifactStore, JobStore, ModelRegistry, RawSample, SampleStore};
use crate::core::job::{JobId, JobOutcome, JobParams, JobStatus, TrainingJob};
use crate::core::registry::ModelVersion;
use crate::utils::lib::retry;

const JOBS_TABLE: &str = "training_jobs";
const SAMPLES_TABLE: &str = "gesture_samples";
const VERSIONS_TABLE: &str = "model_versions";

#[derive(Debug, Clone)]
pub struct SupabaseConfig {
    pub url: String,
    pub service_key: String,
    pub bucket: String,
}

impl SupabaseConfig {
    pub fn from_env(bucket: &str) -> Result<Self> {
        let url = env::var("SUPABASE_URL").context("SUPABASE_URL must be set")?;
        let service_key = env::var("SUPABASE_SERVICE_KEY")
            .or_else(|_| env::var("SUPABASE_SERVICE_ROLE_KEY"))
            .context("SUPABASE_SERVICE_KEY must be set")?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            service_key,
            bucket: bucket.to_string(),
        })
    }

    pub fn log_config(&self) {
        info!("Backend: {}", self.url);
        info!("   Artifact bucket: {}", self.bucket);
    }
}

/// PostgREST + Storage client backing every store trait.
pub struct SupabaseClient {
    config: SupabaseConfig,
    client: reqwest::Client,
    max_retries: u32,
    delay: Duration,
}

impl SupabaseClient {
    pub fn new(config: SupabaseConfig) -> Self {
        Self { config, client: reqwest::Client::new(), max_retries: 3, delay: Duration::from_secs(1) }
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn generate_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = &self.config.service_key;
        headers.insert("apikey", HeaderValue::from_str(key)
            .context("Failed to create apikey header")?);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))
            .context("Failed to create Authorization header")?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.url, table)
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/storage/v1/object/{}/{}", self.config.url, self.config.bucket, key)
    }

    fn rest(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        Ok(builder.headers(self.generate_headers()?))
    }

    async fn send(&self, what: &str, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await
            .with_context(|| format!("Failed to send {} request", what))?;
        if response.status().is_success() {
            debug!("{} request succeeded ({})", what, response.status());
            Ok(response)
        } else {
            let status = response.status();
            let error_text = response.text().await
                .with_context(|| format!("Failed to get error text from {} response", what))?;
            error!("{} request failed ({}): {}", what, status, error_text);
            anyhow::bail!("{} request failed ({}): {}", what, status, error_text)
        }
    }

    async fn rows<T: DeserializeOwned>(&self, what: &str, request: RequestBuilder) -> Result<Vec<T>> {
        let response = self.send(what, request).await?;
        response.json::<Vec<T>>().await
            .with_context(|| format!("Failed to parse {} response as JSON", what))
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Body of the terminal PATCH for a job.
pub fn finish_body(finished_at: DateTime<Utc>, outcome: &JobOutcome) -> Result<Value> {
    let mut body = json!({
        "status": outcome.status(),
        "finished_at": timestamp(finished_at),
    });
    match outcome {
        JobOutcome::Done(result) => body["result"] = result.to_value()?,
        JobOutcome::Failed(error) => body["error"] = json!(error),
    }
    Ok(body)
}

/// Row filter of the terminal PATCH: the job must still be `running` under
/// the caller's own claim, so a reaped and re-claimed run is left alone.
pub fn finish_filter(id: JobId, claimed_at: DateTime<Utc>) -> [(&'static str, String); 3] {
    [
        ("id", format!("eq.{}", id)),
        ("status", "eq.running".to_string()),
        ("started_at", format!("eq.{}", timestamp(claimed_at))),
    ]
}

/// Storage answers a create on a taken key with 409, or with 400 and a
/// `Duplicate` body on older deployments.
fn is_duplicate(status: StatusCode, body: &str) -> bool {
    status == StatusCode::CONFLICT || body.contains("Duplicate") || body.contains("already exists")
}

#[async_trait]
impl SampleStore for SupabaseClient {
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<Vec<RawSample>> {
        retry(self.max_retries, self.delay, || async {
            let request = self.rest(self.client.get(self.table_url(SAMPLES_TABLE)))?
                .query(&[
                    ("select", "label,landmarks".to_string()),
                    ("order", "id.asc".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", limit.to_string()),
                ]);
            self.rows("sample page", request).await
        }).await
    }
}

#[async_trait]
impl JobStore for SupabaseClient {
    async fn oldest_pending(&self) -> Result<Option<TrainingJob>> {
        let request = self.rest(self.client.get(self.table_url(JOBS_TABLE)))?
            .query(&[
                ("select", "*"),
                ("status", "eq.pending"),
                ("order", "created_at.asc,id.asc"),
                ("limit", "1"),
            ]);
        let jobs: Vec<TrainingJob> = self.rows("pending job", request).await?;
        Ok(jobs.into_iter().next())
    }

    async fn claim(&self, id: JobId, started_at: DateTime<Utc>) -> Result<u64> {
        let request = self.rest(self.client.patch(self.table_url(JOBS_TABLE)))?
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", id)), ("status", "eq.pending".to_string())])
            .json(&json!({ "status": JobStatus::Running, "started_at": timestamp(started_at) }));
        let claimed: Vec<Value> = self.rows("claim", request).await?;
        Ok(claimed.len() as u64)
    }

    async fn finish(
        &self,
        id: JobId,
        claimed_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: &JobOutcome,
    ) -> Result<u64> {
        let body = finish_body(finished_at, outcome)?;
        let filter = finish_filter(id, claimed_at);
        retry(self.max_retries, self.delay, || async {
            let request = self.rest(self.client.patch(self.table_url(JOBS_TABLE)))?
                .header("Prefer", "return=representation")
                .query(&filter)
                .json(&body);
            let updated: Vec<Value> = self.rows("job update", request).await?;
            Ok(updated.len() as u64)
        }).await
    }

    async fn enqueue(&self, params: &JobParams) -> Result<TrainingJob> {
        let request = self.rest(self.client.post(self.table_url(JOBS_TABLE)))?
            .header("Prefer", "return=representation")
            .json(&json!({ "status": JobStatus::Pending, "params": params.to_value() }));
        let jobs: Vec<TrainingJob> = self.rows("enqueue", request).await?;
        jobs.into_iter().next().context("Enqueue returned no row")
    }

    async fn get(&self, id: JobId) -> Result<Option<TrainingJob>> {
        let request = self.rest(self.client.get(self.table_url(JOBS_TABLE)))?
            .query(&[("select", "*".to_string()), ("id", format!("eq.{}", id))]);
        let jobs: Vec<TrainingJob> = self.rows("job lookup", request).await?;
        Ok(jobs.into_iter().next())
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>> {
        let request = self.rest(self.client.patch(self.table_url(JOBS_TABLE)))?
            .header("Prefer", "return=representation")
            .query(&[
                ("status", "eq.running".to_string()),
                ("started_at", format!("lt.{}", timestamp(cutoff))),
                ("select", "id".to_string()),
            ])
            .json(&json!({ "status": JobStatus::Pending, "started_at": Value::Null }));
        let rows: Vec<Value> = self.rows("requeue", request).await?;
        let ids: Vec<JobId> = rows.iter().filter_map(|row| row["id"].as_i64()).collect();
        if !ids.is_empty() {
            warn!("Requeued stale jobs: {:?}", ids);
        }
        Ok(ids)
    }
}

#[async_trait]
impl ArtifactStore for SupabaseClient {
    async fn upload(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let mut headers = self.generate_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type)
            .context("Failed to create Content-Type header")?);
        headers.insert("x-upsert", HeaderValue::from_static("true"));
        let request = self.client.post(self.object_url(key)).headers(headers).body(bytes);
        self.send("artifact upload", request).await?;
        info!("Uploaded {}", key);
        Ok(())
    }

    async fn create(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<bool> {
        let mut headers = self.generate_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type)
            .context("Failed to create Content-Type header")?);
        headers.insert("x-upsert", HeaderValue::from_static("false"));
        let response = self.client.post(self.object_url(key)).headers(headers).body(bytes)
            .send().await
            .context("Failed to send artifact create request")?;
        let status = response.status();
        if status.is_success() {
            info!("Created {}", key);
            return Ok(true);
        }
        let error_text = response.text().await
            .context("Failed to get error text from artifact create response")?;
        if is_duplicate(status, &error_text) {
            debug!("{} already exists", key);
            return Ok(false);
        }
        error!("artifact create request failed ({}): {}", status, error_text);
        anyhow::bail!("artifact create request failed ({}): {}", status, error_text)
    }

    fn public_uri(&self, key: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.config.url, self.config.bucket, key)
    }
}

#[async_trait]
impl ModelRegistry for SupabaseClient {
    async fn insert(&self, record: &ModelVersion) -> Result<()> {
        let request = self.rest(self.client.post(self.table_url(VERSIONS_TABLE)))?
            .header("Prefer", "return=minimal")
            .json(record);
        self.send("model version insert", request).await?;
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<ModelVersion>> {
        let request = self.rest(self.client.get(self.table_url(VERSIONS_TABLE)))?
            .query(&[
                ("select", "version,accuracy,loss,artifact_uri,created_at".to_string()),
                ("order", "created_at.desc,version.desc".to_string()),
                ("limit", limit.to_string()),
            ]);
        self.rows("model listing", request).await
    }
}
