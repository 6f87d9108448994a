// src/registry.rs
use log::{info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::artifact::{ArtifactBlob, ArtifactMeta, ModelArtifact};
use crate::errors::{EngineError, EngineResult};
use crate::store::ArtifactStore;

/// Sole holder of the serving artifact.
///
/// Readers clone the current `Arc` and keep using it across a swap; a commit or
/// rollback persists first (payload, then the active pointer) and only then
/// replaces the pointer in memory.
pub struct ModelRegistry {
    current: RwLock<Option<Arc<ModelArtifact>>>,
    next_version: AtomicU64,
    store: Arc<dyn ArtifactStore>,
}

impl ModelRegistry {
    pub fn new(store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            current: RwLock::new(None),
            next_version: AtomicU64::new(1),
            store,
        }
    }

    /// Serves the persisted active version; the newest one when none is recorded.
    pub async fn restore(&self) -> EngineResult<Option<u64>> {
        let versions = self.store.list().await?;
        let Some(latest) = versions.last() else {
            info!("📭 No persisted models; waiting for a first training run");
            return Ok(None);
        };
        self.next_version.fetch_max(latest.version + 1, Ordering::SeqCst);
        let serve = match self.store.active().await? {
            Some(v) if versions.iter().any(|m| m.version == v) => v,
            Some(v) => {
                warn!("⚠️ Active model v{} is not stored; serving newest v{}", v, latest.version);
                latest.version
            }
            None => latest.version,
        };
        let artifact = self.load(serve).await?;
        self.swap(Arc::new(artifact));
        info!("📦 Restored model v{} ({} versions on record)", serve, versions.len());
        Ok(Some(serve))
    }

    pub fn current(&self) -> Option<Arc<ModelArtifact>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn current_version(&self) -> Option<u64> {
        self.current().map(|a| a.version)
    }

    /// Assigns the next version, persists, then swaps.
    pub async fn commit(&self, mut artifact: ModelArtifact) -> EngineResult<Arc<ModelArtifact>> {
        artifact.version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let blob = ArtifactBlob::seal(&artifact)?;
        self.store.put(&blob).await?;
        self.store.set_active(artifact.version).await?;
        let artifact = Arc::new(artifact);
        let previous = self.swap(artifact.clone());
        info!(
            "✅ Committed model v{} ({}), replacing {}",
            artifact.version,
            artifact.ensemble.name,
            previous.map_or("nothing".to_string(), |p| format!("v{}", p.version))
        );
        Ok(artifact)
    }

    /// Serves the newest persisted version older than the current one.
    pub async fn rollback(&self) -> EngineResult<Arc<ModelArtifact>> {
        let current = self.current().ok_or(EngineError::ModelNotTrained)?;
        let target = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|m| m.version)
            .filter(|&v| v < current.version)
            .max()
            .ok_or_else(|| {
                EngineError::Internal(format!("no version older than v{} to roll back to", current.version))
            })?;
        let artifact = Arc::new(self.load(target).await?);
        self.store.set_active(target).await?;
        self.swap(artifact.clone());
        warn!("⏪ Rolled back from model v{} to v{}", current.version, target);
        Ok(artifact)
    }

    pub async fn versions(&self) -> EngineResult<Vec<ArtifactMeta>> {
        Ok(self.store.list().await?)
    }

    async fn load(&self, version: u64) -> EngineResult<ModelArtifact> {
        let blob = self
            .store
            .get(version)
            .await?
            .ok_or_else(|| EngineError::Storage(anyhow::anyhow!("model v{} is listed but missing", version)))?;
        blob.open()
    }

    fn swap(&self, artifact: Arc<ModelArtifact>) -> Option<Arc<ModelArtifact>> {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.replace(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::test_support::trained_artifact;
    use crate::store::memory::MemoryArtifactStore;

    #[tokio::test]
    async fn test_commit_assigns_versions_and_rollback_restores() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::default());
        let registry = ModelRegistry::new(store.clone());
        assert!(registry.current().is_none());
        assert!(matches!(registry.rollback().await, Err(EngineError::ModelNotTrained)));

        let base = trained_artifact(51);
        let first = registry.commit(base.clone()).await.unwrap();
        let held = registry.current().unwrap();
        let second = registry.commit(base).await.unwrap();
        assert_eq!((first.version, second.version), (1, 2));
        // A reader holding the old snapshot is unaffected by the swap.
        assert_eq!(held.version, 1);
        assert_eq!(registry.current_version(), Some(2));

        let restored = registry.rollback().await.unwrap();
        assert_eq!(restored.version, 1);
        assert_eq!(*restored, *first);
        assert!(registry.rollback().await.is_err());

        // A fresh registry over the same store keeps the rollback and keeps counting.
        let reopened = ModelRegistry::new(store.clone());
        assert_eq!(reopened.restore().await.unwrap(), Some(1));
        assert_eq!(reopened.current().map(|a| (*a).clone()), Some((*first).clone()));
        let third = reopened.commit(trained_artifact(52)).await.unwrap();
        assert_eq!(third.version, 3);
        assert_eq!(reopened.versions().await.unwrap().len(), 3);

        let again = ModelRegistry::new(store);
        assert_eq!(again.restore().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_restore_without_pointer_serves_newest() {
        let store = Arc::new(MemoryArtifactStore::default());
        let mut artifact = trained_artifact(53);
        for version in [1, 2] {
            artifact.version = version;
            store.put(&ArtifactBlob::seal(&artifact).unwrap()).await.unwrap();
        }
        let registry = ModelRegistry::new(store);
        assert_eq!(registry.restore().await.unwrap(), Some(2));
        assert_eq!(registry.commit(artifact).await.unwrap().version, 3);
    }
}
