use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

use crate::adapters::store::{ArtifactStore, ModelRegistry};
use crate::core::evaluate::{ClassMetrics, Evaluation};
use crate::core::model::{
    GestureClassifier, CONFIG_FILE, HISTORY_FILE, LABELS_FILE, LABEL_MAP_FILE, MODEL_FILE,
};
use crate::core::registry::ModelVersion;
use crate::core::train::History;
use crate::utils::lib::{retry, VersionClock};

const UPLOAD_CONCURRENCY: usize = 4;
const VERSION_ATTEMPTS: usize = 16;

#[derive(Serialize)]
struct HistoryDocument<'a> {
    version: &'a str,
    created_at: DateTime<Utc>,
    labels: &'a [String],
    samples: usize,
    history: &'a History,
    test_loss: f64,
    test_accuracy: f64,
    macro_precision: f64,
    macro_recall: f64,
    macro_f1: f64,
    confusion_matrix: &'a [Vec<u64>],
    per_class: &'a [ClassMetrics],
}

#[derive(Debug)]
pub struct Publication {
    pub record: ModelVersion,
    pub files: Vec<String>,
}

pub struct ArtifactPublisher {
    artifacts: Arc<dyn ArtifactStore>,
    registry: Arc<dyn ModelRegistry>,
    clock: VersionClock,
    max_retries: u32,
    delay: Duration,
}

impl ArtifactPublisher {
    pub fn new(artifacts: Arc<dyn ArtifactStore>, registry: Arc<dyn ModelRegistry>) -> Self {
        Self {
            artifacts,
            registry,
            clock: VersionClock::new(),
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.delay = delay;
        self
    }

    /// Reserves a fresh version, stages the bundle, uploads every file under it
    /// and only then writes the registry record.
    pub async fn publish(
        &self,
        model: &GestureClassifier,
        history: &History,
        evaluation: &Evaluation,
        samples: usize,
    ) -> Result<Publication> {
        let created_at = Utc::now();
        let labels = serde_json::to_vec_pretty(&model.labels)
            .context("Failed to serialize labels")?;
        let version = self.reserve_version(created_at, labels).await?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", version))
            .tempdir()
            .context("Failed to create staging directory")?;
        info!("Publishing model {} from {:?}", version, staging.path());

        let document = HistoryDocument {
            version: &version,
            created_at,
            labels: &model.labels,
            samples,
            history,
            test_loss: evaluation.test_loss,
            test_accuracy: evaluation.test_accuracy,
            macro_precision: evaluation.macro_precision,
            macro_recall: evaluation.macro_recall,
            macro_f1: evaluation.macro_f1,
            confusion_matrix: &evaluation.confusion,
            per_class: &evaluation.per_class,
        };
        let files = stage_bundle(staging.path(), model, &document)?;

        stream::iter(files.iter().filter(|name| name.as_str() != LABELS_FILE))
            .map(|name| self.upload_file(staging.path(), &version, name))
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .try_collect::<Vec<()>>()
            .await
            .with_context(|| format!("Failed to upload artifacts for {}", version))?;

        let record = ModelVersion {
            version: version.clone(),
            accuracy: evaluation.test_accuracy * 100.0,
            loss: evaluation.test_loss,
            artifact_uri: self.artifacts.public_uri(&version),
            created_at,
        };
        self.registry.insert(&record).await
            .with_context(|| format!("Failed to register model version {}", version))?;
        info!("Registered model {} ({:.2}% accuracy)", version, record.accuracy);

        Ok(Publication { record, files })
    }

    /// Mints versions until one is free, claiming it by creating its
    /// `labels.json`. Another instance may mint the same id in the same
    /// millisecond; the create fails for the loser, who moves on to a later id.
    async fn reserve_version(&self, now: DateTime<Utc>, labels: Vec<u8>) -> Result<String> {
        for _ in 0..VERSION_ATTEMPTS {
            let version = self.clock.mint(now);
            let key = format!("{}/{}", version, LABELS_FILE);
            let created = retry(self.max_retries, self.delay, || {
                self.artifacts.create(&key, labels.clone(), content_type(LABELS_FILE))
            }).await
            .with_context(|| format!("Failed to reserve version {}", version))?;
            if created {
                debug!("Reserved version {}", version);
                return Ok(version);
            }
            warn!("Version {} is already taken, minting another", version);
        }
        bail!("No free model version after {} attempts", VERSION_ATTEMPTS)
    }

    async fn upload_file(&self, staging: &Path, version: &str, name: &str) -> Result<()> {
        let bytes = tokio::fs::read(staging.join(name)).await
            .with_context(|| format!("Failed to read staged file {}", name))?;
        let key = format!("{}/{}", version, name);
        let content_type = content_type(name);
        retry(self.max_retries, self.delay, || {
            self.artifacts.upload(&key, bytes.clone(), content_type)
        }).await
        .with_context(|| format!("Failed to upload {}", key))?;
        debug!("Uploaded {} ({} bytes)", key, bytes.len());
        Ok(())
    }
}

fn content_type(name: &str) -> &'static str {
    if name.ends_with(".json") { "application/json" } else { "application/octet-stream" }
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<String> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize {}", name))?;
    std::fs::write(dir.join(name), bytes)
        .with_context(|| format!("Failed to write {}", name))?;
    Ok(name.to_string())
}

fn stage_bundle(dir: &Path, model: &GestureClassifier, document: &HistoryDocument) -> Result<Vec<String>> {
    model.save_weights(&dir.join(MODEL_FILE))?;
    Ok(vec![
        MODEL_FILE.to_string(),
        write_json(dir, CONFIG_FILE, &model.config)?,
        write_json(dir, LABELS_FILE, &model.labels)?,
        write_json(dir, LABEL_MAP_FILE, &model.label_map())?,
        write_json(dir, HISTORY_FILE, document)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryStore;
    use crate::adapters::store::{MockArtifactStore, MockModelRegistry};
    use candle_core::Device;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixtures() -> (GestureClassifier, History, Evaluation) {
        let model = GestureClassifier::init(vec!["A".into(), "B".into()], Device::Cpu).unwrap();
        let evaluation = Evaluation {
            test_loss: 0.4,
            test_accuracy: 0.75,
            confusion: vec![vec![2, 0], vec![1, 1]],
            per_class: vec![
                ClassMetrics { label: "A".into(), precision: 0.66, recall: 1.0, f1: 0.8, support: 2 },
                ClassMetrics { label: "B".into(), precision: 1.0, recall: 0.5, f1: 0.66, support: 2 },
            ],
            macro_precision: 0.83,
            macro_recall: 0.75,
            macro_f1: 0.73,
        };
        (model, History::default(), evaluation)
    }

    #[tokio::test]
    async fn publishes_full_bundle_then_registers() {
        let store = MemoryStore::new();
        let publisher = ArtifactPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let (model, history, evaluation) = fixtures();

        let publication = publisher.publish(&model, &history, &evaluation, 12).await.unwrap();
        let version = &publication.record.version;
        assert!(version.starts_with('v'));
        assert_eq!(publication.record.accuracy, 75.0);
        assert_eq!(publication.files.len(), 5);

        let keys = store.object_keys().await;
        for name in [MODEL_FILE, CONFIG_FILE, LABELS_FILE, LABEL_MAP_FILE, HISTORY_FILE] {
            assert!(keys.contains(&format!("{}/{}", version, name)), "missing {}", name);
        }
        let labels: Vec<String> =
            serde_json::from_slice(&store.object(&format!("{}/{}", version, LABELS_FILE)).await.unwrap()).unwrap();
        assert_eq!(labels, vec!["A", "B"]);
        let map: serde_json::Value =
            serde_json::from_slice(&store.object(&format!("{}/{}", version, LABEL_MAP_FILE)).await.unwrap()).unwrap();
        assert_eq!(map, serde_json::json!({"A": 0, "B": 1}));
        assert_eq!(store.versions().await, vec![publication.record]);
    }

    #[tokio::test]
    async fn consecutive_publishes_mint_new_versions() {
        let store = MemoryStore::new();
        let publisher = ArtifactPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let (model, history, evaluation) = fixtures();
        let first = publisher.publish(&model, &history, &evaluation, 12).await.unwrap();
        let second = publisher.publish(&model, &history, &evaluation, 12).await.unwrap();
        assert!(first.record.version < second.record.version);
        assert_eq!(store.versions().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_upload_leaves_registry_untouched() {
        let mut artifacts = MockArtifactStore::new();
        artifacts.expect_create().times(1).returning(|_, _, _| Ok(true));
        artifacts.expect_upload().returning(|key, _, _| {
            if key.ends_with(MODEL_FILE) { Err(anyhow::anyhow!("storage unavailable")) } else { Ok(()) }
        });
        artifacts.expect_public_uri().returning(|key| key.to_string());
        let mut registry = MockModelRegistry::new();
        registry.expect_insert().never();

        let publisher = ArtifactPublisher::new(Arc::new(artifacts), Arc::new(registry))
            .with_retries(1, Duration::from_millis(1));
        let (model, history, evaluation) = fixtures();
        let err = publisher.publish(&model, &history, &evaluation, 12).await.unwrap_err();
        assert!(format!("{:#}", err).contains("storage unavailable"));
    }

    #[tokio::test]
    async fn transient_upload_failure_is_retried() {
        let registry = MemoryStore::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut artifacts = MockArtifactStore::new();
        artifacts.expect_create().returning(|_, _, _| Ok(true));
        artifacts.expect_upload().returning(move |key, _, _| {
            if key.ends_with(HISTORY_FILE) && counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(anyhow::anyhow!("timeout"));
            }
            Ok(())
        });
        artifacts.expect_public_uri().returning(|key| format!("memory://{}", key));

        let publisher = ArtifactPublisher::new(Arc::new(artifacts), Arc::new(registry.clone()))
            .with_retries(2, Duration::from_millis(1));
        let (model, history, evaluation) = fixtures();
        publisher.publish(&model, &history, &evaluation, 12).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(registry.versions().await.len(), 1);
    }

    #[tokio::test]
    async fn taken_version_is_skipped_without_overwriting() {
        let store = MemoryStore::new();
        let first = ArtifactPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let second = ArtifactPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let now = Utc::now();

        let a = first.reserve_version(now, b"[\"A\"]".to_vec()).await.unwrap();
        let b = second.reserve_version(now, b"[\"X\"]".to_vec()).await.unwrap();
        assert!(a < b, "{} {}", a, b);
        assert_eq!(store.object(&format!("{}/{}", a, LABELS_FILE)).await.unwrap(), b"[\"A\"]".to_vec());
        assert_eq!(store.object(&format!("{}/{}", b, LABELS_FILE)).await.unwrap(), b"[\"X\"]".to_vec());
    }

    #[tokio::test]
    async fn concurrent_publishers_keep_their_own_bundles() {
        let store = MemoryStore::new();
        let first = ArtifactPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let second = ArtifactPublisher::new(Arc::new(store.clone()), Arc::new(store.clone()));
        let (model_ab, history, evaluation) = fixtures();
        let model_xy = GestureClassifier::init(vec!["X".into(), "Y".into()], Device::Cpu).unwrap();

        for _ in 0..10 {
            let (a, b) = tokio::join!(
                first.publish(&model_ab, &history, &evaluation, 12),
                second.publish(&model_xy, &history, &evaluation, 12),
            );
            let (a, b) = (a.unwrap(), b.unwrap());
            assert_ne!(a.record.version, b.record.version);
            for (publication, expected) in [(&a, ["A", "B"]), (&b, ["X", "Y"])] {
                let key = format!("{}/{}", publication.record.version, LABELS_FILE);
                let labels: Vec<String> = serde_json::from_slice(&store.object(&key).await.unwrap()).unwrap();
                assert_eq!(labels, expected);
            }
        }
        assert_eq!(store.versions().await.len(), 20);
    }

    #[tokio::test]
    async fn reservation_gives_up_when_every_version_is_taken() {
        let mut artifacts = MockArtifactStore::new();
        artifacts.expect_create().times(VERSION_ATTEMPTS).returning(|_, _, _| Ok(false));
        artifacts.expect_upload().never();
        let mut registry = MockModelRegistry::new();
        registry.expect_insert().never();

        let publisher = ArtifactPublisher::new(Arc::new(artifacts), Arc::new(registry));
        let (model, history, evaluation) = fixtures();
        let err = publisher.publish(&model, &history, &evaluation, 12).await.unwrap_err();
        assert!(format!("{:#}", err).contains("No free model version"));
    }
}
