// src/store/fs.rs
//
// Filesystem layout: `<models_dir>/model_v{N}.json` holds the serialized artifact,
// `model_v{N}.meta.json` its header and `current` the served version number;
// feedback is one JSON object per line.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ArtifactStore, FeedbackStore};
use crate::artifact::{ArtifactBlob, ArtifactMeta};
use crate::feedback::FeedbackRecord;

pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create models directory {}", dir.display()))?;
        info!("📁 Artifact store at {}", dir.display());
        Ok(Self { dir })
    }

    fn model_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("model_v{}.json", version))
    }

    fn meta_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("model_v{}.meta.json", version))
    }

    fn current_path(&self) -> PathBuf {
        self.dir.join("current")
    }
}

/// Writes through a temporary file so a crash never leaves a half-written file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, blob: &ArtifactBlob) -> Result<()> {
        let version = blob.meta.version;
        let meta_path = self.meta_path(version);
        if fs::try_exists(&meta_path).await.unwrap_or(false) {
            bail!("model v{} is already stored", version);
        }
        // Payload first: a header only ever points at a complete payload.
        write_atomic(&self.model_path(version), &blob.bytes).await?;
        let meta = serde_json::to_vec_pretty(&blob.meta).context("Failed to serialize model header")?;
        write_atomic(&meta_path, &meta).await?;
        debug!("Stored model v{} ({} bytes)", version, blob.bytes.len());
        Ok(())
    }

    async fn get(&self, version: u64) -> Result<Option<ArtifactBlob>> {
        let meta_path = self.meta_path(version);
        if !fs::try_exists(&meta_path).await.unwrap_or(false) {
            return Ok(None);
        }
        let meta_bytes = fs::read(&meta_path)
            .await
            .with_context(|| format!("Failed to read {}", meta_path.display()))?;
        let meta: ArtifactMeta = serde_json::from_slice(&meta_bytes)
            .with_context(|| format!("Failed to parse {}", meta_path.display()))?;
        let model_path = self.model_path(version);
        let bytes = fs::read(&model_path)
            .await
            .with_context(|| format!("Failed to read {}", model_path.display()))?;
        Ok(Some(ArtifactBlob { meta, bytes }))
    }

    async fn list(&self) -> Result<Vec<ArtifactMeta>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list {}", self.dir.display()))?;
        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".meta.json") {
                continue;
            }
            match fs::read(entry.path()).await.map(|b| serde_json::from_slice::<ArtifactMeta>(&b)) {
                Ok(Ok(meta)) => metas.push(meta),
                Ok(Err(e)) => warn!("⚠️ Ignoring unreadable model header {}: {}", name, e),
                Err(e) => warn!("⚠️ Ignoring model header {}: {}", name, e),
            }
        }
        metas.sort_by_key(|m| m.version);
        Ok(metas)
    }

    async fn set_active(&self, version: u64) -> Result<()> {
        if !fs::try_exists(&self.meta_path(version)).await.unwrap_or(false) {
            bail!("model v{} is not stored", version);
        }
        write_atomic(&self.current_path(), format!("{}\n", version).as_bytes()).await
    }

    async fn active(&self) -> Result<Option<u64>> {
        let path = self.current_path();
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let version = raw
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{} does not hold a version number", path.display()))?;
        Ok(Some(version))
    }
}

pub struct FsFeedbackStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FsFeedbackStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl FeedbackStore for FsFeedbackStore {
    async fn append(&self, record: &FeedbackRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialize feedback record")?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FeedbackRecord>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedbackRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "⚠️ Skipping malformed feedback line {} in {}: {}",
                    line_no + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::trained_artifact;
    use crate::calibration::Decision;
    use crate::engine::Prediction;
    use crate::feedback::Outcome;
    use crate::features::test_support::example_application;

    #[tokio::test]
    async fn test_artifact_survives_round_trip_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::open(dir.path().join("models")).await.unwrap();
        let artifact = trained_artifact(41);
        let blob = ArtifactBlob::seal(&artifact).unwrap();
        store.put(&blob).await.unwrap();
        assert!(store.put(&blob).await.is_err());

        let loaded = store.get(artifact.version).await.unwrap().unwrap();
        assert_eq!(loaded, blob);
        assert_eq!(loaded.open().unwrap(), artifact);
        assert!(dir.path().join("models/model_v1.json").exists());

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].version, 1);
        assert!(store.get(7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_active_pointer_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let models = dir.path().join("models");
        let store = FsArtifactStore::open(&models).await.unwrap();
        assert_eq!(store.active().await.unwrap(), None);

        let mut artifact = trained_artifact(43);
        store.put(&ArtifactBlob::seal(&artifact).unwrap()).await.unwrap();
        artifact.version = 2;
        store.put(&ArtifactBlob::seal(&artifact).unwrap()).await.unwrap();
        store.set_active(2).await.unwrap();
        store.set_active(1).await.unwrap();
        assert!(store.set_active(9).await.is_err());

        let reopened = FsArtifactStore::open(&models).await.unwrap();
        assert_eq!(reopened.active().await.unwrap(), Some(1));
        // The pointer file is not mistaken for a model header.
        assert_eq!(reopened.list().await.unwrap().len(), 2);

        std::fs::write(models.join("current"), "garbage").unwrap();
        assert!(reopened.active().await.is_err());
    }

    #[tokio::test]
    async fn test_feedback_jsonl_appends_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/feedback.jsonl");
        let store = FsFeedbackStore::open(&path).await.unwrap();
        let shown = Prediction {
            raw_score: 0.3,
            probability_default: 0.2,
            decision: Decision::Approve,
            model_version: 1,
        };
        let first = FeedbackRecord::new(example_application(), shown.clone(), Outcome::Default);
        let second = FeedbackRecord::new(example_application(), shown, Outcome::Repaid);
        store.append(&first).await.unwrap();
        {
            let mut file = fs::OpenOptions::new().append(true).open(&path).await.unwrap();
            file.write_all(b"not json\n").await.unwrap();
        }
        store.append(&second).await.unwrap();

        let records = store.list().await.unwrap();
        assert_eq!(records, vec![first, second]);
    }
}
