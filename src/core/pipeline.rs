use anyhow::{anyhow, Context, Result};
use candle_core::Device;
use log::{debug, info};
use std::sync::Arc;

use crate::adapters::store::{RawSample, SampleStore};
use crate::core::evaluate::{evaluate, Evaluation};
use crate::core::job::{JobParams, JobResult, TrainedSummary};
use crate::core::model::GestureClassifier;
use crate::core::preprocess::{Dataset, Prepared, Preprocessor};
use crate::core::publish::ArtifactPublisher;
use crate::core::train::{History, TrainConfig, Trainer};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub min_samples: usize,
    pub page_size: usize,
    pub train: TrainConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { min_samples: 10, page_size: 1000, train: TrainConfig::default() }
    }
}

/// Reads every sample row, page by page, until a short page comes back.
pub async fn fetch_all_samples(store: &dyn SampleStore, page_size: usize) -> Result<Vec<RawSample>> {
    let page_size = page_size.max(1);
    let mut samples = Vec::new();
    loop {
        let page = store.fetch_page(samples.len(), page_size).await
            .with_context(|| format!("Failed to fetch samples at offset {}", samples.len()))?;
        let done = page.len() < page_size;
        debug!("Fetched {} samples at offset {}", page.len(), samples.len());
        samples.extend(page);
        if done {
            break;
        }
    }
    info!("Fetched {} samples", samples.len());
    Ok(samples)
}

/// fetch -> preprocess -> train -> evaluate -> publish, for one job.
pub struct TrainingPipeline {
    samples: Arc<dyn SampleStore>,
    publisher: ArtifactPublisher,
    config: PipelineConfig,
}

impl TrainingPipeline {
    pub fn new(samples: Arc<dyn SampleStore>, publisher: ArtifactPublisher, config: PipelineConfig) -> Self {
        Self { samples, publisher, config }
    }

    pub async fn run(&self, params: &JobParams) -> Result<JobResult> {
        let JobParams::TrainGesture(train_params) = params;
        let mut train_config = self.config.train.clone();
        train_config.seed = train_params.seed.or(train_config.seed);
        if let Some(max_epochs) = train_params.max_epochs {
            train_config.max_epochs = max_epochs;
        }

        let raw = fetch_all_samples(self.samples.as_ref(), self.config.page_size).await?;
        let preprocessor = Preprocessor::new(self.config.min_samples).with_seed(train_config.seed);
        let dataset = match preprocessor.prepare(&raw) {
            Prepared::Ready(dataset) => dataset,
            Prepared::NotEnoughSamples(n) => return Ok(JobResult::not_enough_samples(n)),
        };
        let samples = dataset.total();
        let classes = dataset.labels.clone();

        let (model, history, evaluation) = tokio::task::spawn_blocking(move || {
            fit_and_evaluate(&dataset, &train_config)
        })
        .await
        .map_err(|e| anyhow!("Training task aborted: {}", e))??;

        let publication = self.publisher.publish(&model, &history, &evaluation, samples).await?;
        let record = publication.record;
        Ok(JobResult::Trained(TrainedSummary {
            ok: true,
            version: record.version,
            accuracy: record.accuracy,
            loss: record.loss,
            macro_precision: evaluation.macro_precision,
            macro_recall: evaluation.macro_recall,
            macro_f1: evaluation.macro_f1,
            classes,
            samples,
            epochs_run: history.epochs.len(),
            artifact_uri: record.artifact_uri,
        }))
    }
}

fn fit_and_evaluate(
    dataset: &Dataset,
    config: &TrainConfig,
) -> Result<(GestureClassifier, History, Evaluation)> {
    let device = Device::Cpu;
    let (model, history) = Trainer::new(config.clone()).fit(dataset, &device)
        .context("Training failed")?;
    let evaluation = evaluate(&model, &dataset.test).context("Evaluation failed")?;
    Ok((model, history, evaluation))
}
