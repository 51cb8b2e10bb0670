use anyhow::{Context, Result};
use std::sync::Arc;
use clap::Parser;
use log::info;
use tokio::time::Duration;
use crate::adapters::fs::FsArtifactStore;
use crate::adapters::store::{ArtifactStore, JobStore, ModelRegistry};
use crate::adapters::supabase::{SupabaseClient, SupabaseConfig};
use crate::core::job::{JobParams, TrainParams};
use crate::core::pipeline::{PipelineConfig, TrainingPipeline};
use crate::core::publish::ArtifactPublisher;
use crate::core::worker::{Worker, WorkerConfig};
use crate::utils::lib::*;

pub async fn run_cli_interface() -> Result<()> {
    let args = Args::parse();
    let config = SupabaseConfig::from_env(&args.bucket)
        .context("Failed to load backend configuration")?;
    config.log_config();
    let retry_delay = Duration::from_secs(args.retry_delay_secs);
    let client = Arc::new(
        SupabaseClient::new(config)
            .with_retries(args.max_retries)
            .with_delay(retry_delay),
    );

    match args.command {
        Command::Worker(worker_args) => {
            run_worker(client, worker_args, args.max_retries, retry_delay).await
        }
        Command::Enqueue { seed, max_epochs } => {
            let params = JobParams::TrainGesture(TrainParams { seed, max_epochs });
            let job = client.enqueue(&params).await
                .context("Failed to enqueue training job")?;
            println!("Enqueued job {} ({})", job.id, job.status.as_str());
            Ok(())
        }
        Command::Models { limit } => {
            let models = client.list(limit).await
                .context("Failed to list model versions")?;
            for model in models {
                println!(
                    "{}\t{:.2}%\tloss={:.4}\t{}\t{}",
                    model.version,
                    model.accuracy,
                    model.loss,
                    model.created_at.to_rfc3339(),
                    model.artifact_uri
                );
            }
            Ok(())
        }
    }
}

async fn run_worker(
    client: Arc<SupabaseClient>,
    args: WorkerArgs,
    max_retries: u32,
    retry_delay: Duration,
) -> Result<()> {
    let artifacts: Arc<dyn ArtifactStore> = match &args.artifact_dir {
        Some(dir) => {
            info!("Publishing bundles to {:?}", dir);
            Arc::new(FsArtifactStore::new(dir.clone()))
        }
        None => client.clone(),
    };
    let registry: Arc<dyn ModelRegistry> = client.clone();
    let jobs: Arc<dyn JobStore> = client.clone();

    let publisher = ArtifactPublisher::new(artifacts, registry)
        .with_retries(max_retries, retry_delay);
    let pipeline_config = PipelineConfig {
        min_samples: args.min_samples,
        page_size: args.page_size,
        ..Default::default()
    };
    let pipeline = TrainingPipeline::new(client, publisher, pipeline_config);
    let worker_config = WorkerConfig {
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        lease: args.lease_secs.map(Duration::from_secs),
    };
    Worker::new(jobs, pipeline, worker_config).run().await;
    Ok(())
}
