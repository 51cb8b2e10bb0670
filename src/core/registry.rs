use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::adapters::store::ModelRegistry;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelVersion {
    pub version: String,
    /// Test accuracy in percent.
    pub accuracy: f64,
    pub loss: f64,
    pub artifact_uri: String,
    pub created_at: DateTime<Utc>,
}

/// Handle on the newest published model.
///
/// Consumers own one of these and decide when to refresh it; nothing in the
/// crate keeps a process-wide copy.
pub struct LatestModel {
    registry: Arc<dyn ModelRegistry>,
    cached: RwLock<Option<ModelVersion>>,
}

impl LatestModel {
    pub fn new(registry: Arc<dyn ModelRegistry>) -> Self {
        Self { registry, cached: RwLock::new(None) }
    }

    /// Cached record, fetched on first use.
    pub async fn current(&self) -> Result<Option<ModelVersion>> {
        if let Some(model) = self.cached.read().await.as_ref() {
            return Ok(Some(model.clone()));
        }
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<Option<ModelVersion>> {
        let latest = self.registry.list(1).await
            .context("Failed to read latest model version")?
            .into_iter()
            .next();
        match &latest {
            Some(model) => info!("Latest model is {} ({:.2}%)", model.version, model.accuracy),
            None => debug!("Model registry is empty"),
        }
        *self.cached.write().await = latest.clone();
        Ok(latest)
    }

    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }
}
