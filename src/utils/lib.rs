use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use chrono::{DateTime, TimeZone, Utc};
use log::warn;

use tokio::time::{sleep, Duration};
use std::future::Future;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,

    /// Storage bucket holding published model bundles.
    #[clap(long, env = "MODEL_BUCKET", default_value = "models", global = true)]
    pub bucket: String,

    /// Retries for backend requests that are safe to repeat.
    #[clap(long, env = "MAX_RETRIES", default_value = "3", global = true)]
    pub max_retries: u32,

    #[clap(long, default_value = "1", global = true)]
    pub retry_delay_secs: u64,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Poll the job queue and train models until interrupted.
    Worker(WorkerArgs),
    /// Insert a pending training job.
    Enqueue {
        #[clap(long)]
        seed: Option<u64>,

        #[clap(long)]
        max_epochs: Option<usize>,
    },
    /// List published model versions, newest first.
    Models {
        #[clap(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct WorkerArgs {
    #[clap(long, default_value = "5")]
    pub poll_interval_secs: u64,

    #[clap(long, default_value = "10")]
    pub min_samples: usize,

    #[clap(long, default_value = "1000")]
    pub page_size: usize,

    /// Requeue jobs left `running` for longer than this many seconds.
    #[clap(long)]
    pub lease_secs: Option<u64>,

    /// Publish bundles to this directory instead of the storage bucket.
    #[clap(long, value_parser)]
    pub artifact_dir: Option<PathBuf>,
}

pub fn create_progress_bar(total: u64) -> Result<ProgressBar, io::Error> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs ({eta})")
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

pub async fn retry<F, Fut, T>(
    max_retries: u32,
    initial_delay: Duration,
    mut task: F
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    let mut delay = initial_delay;

    loop {
        match task().await {
            Ok(result) => return Ok(result),
            Err(e) if retries >= max_retries => {
                return Err(e).context(format!("Task failed after {} retries", max_retries))
            },
            Err(e) => {
                warn!("Task failed: {:#}. Retrying in {:?}...", e, delay);
                sleep(delay).await;
                retries += 1;
                delay *= 2;
            }
        }
    }
}

/// Mints model version ids from wall-clock milliseconds. Ids handed out by one
/// clock are strictly increasing even if two runs land in the same millisecond
/// or the system clock steps back.
#[derive(Debug, Default)]
pub struct VersionClock {
    last_millis: AtomicI64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&self, now: DateTime<Utc>) -> String {
        let wanted = now.timestamp_millis();
        let previous = self.last_millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(wanted.max(last + 1)))
            .unwrap_or(wanted - 1);
        let millis = wanted.max(previous + 1);
        let stamp = Utc.timestamp_millis_opt(millis).single().unwrap_or(now);
        format!("v{}", stamp.format("%Y%m%d%H%M%S%3f"))
    }
}
