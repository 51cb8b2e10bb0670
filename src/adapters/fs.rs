use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

use super::store::ArtifactStore;

/// Artifact store on a local directory; keys map to relative paths.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    async fn prepare(&self, key: &str) -> Result<PathBuf> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
        Ok(path)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.prepare(key).await?;
        tokio::fs::write(&path, bytes).await
            .with_context(|| format!("Failed to write artifact {:?}", path))?;
        debug!("Wrote artifact {:?}", path);
        Ok(())
    }

    async fn create(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<bool> {
        let path = self.prepare(key).await?;
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e).with_context(|| format!("Failed to create artifact {:?}", path)),
        };
        file.write_all(&bytes).await
            .with_context(|| format!("Failed to write artifact {:?}", path))?;
        file.flush().await
            .with_context(|| format!("Failed to flush artifact {:?}", path))?;
        debug!("Created artifact {:?}", path);
        Ok(true)
    }

    fn public_uri(&self, key: &str) -> String {
        let root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        format!("file://{}", root.join(key).display())
    }
}
