// src/store/memory.rs
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{ArtifactStore, FeedbackStore};
use crate::artifact::{ArtifactBlob, ArtifactMeta};
use crate::feedback::FeedbackRecord;

#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: Mutex<BTreeMap<u64, ArtifactBlob>>,
    active: Mutex<Option<u64>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, blob: &ArtifactBlob) -> Result<()> {
        let mut blobs = self.blobs.lock().await;
        if blobs.contains_key(&blob.meta.version) {
            bail!("model v{} is already stored", blob.meta.version);
        }
        blobs.insert(blob.meta.version, blob.clone());
        Ok(())
    }

    async fn get(&self, version: u64) -> Result<Option<ArtifactBlob>> {
        Ok(self.blobs.lock().await.get(&version).cloned())
    }

    async fn list(&self) -> Result<Vec<ArtifactMeta>> {
        Ok(self.blobs.lock().await.values().map(|b| b.meta.clone()).collect())
    }

    async fn set_active(&self, version: u64) -> Result<()> {
        if !self.blobs.lock().await.contains_key(&version) {
            bail!("model v{} is not stored", version);
        }
        *self.active.lock().await = Some(version);
        Ok(())
    }

    async fn active(&self) -> Result<Option<u64>> {
        Ok(*self.active.lock().await)
    }
}

#[derive(Default)]
pub struct MemoryFeedbackStore {
    records: Mutex<Vec<FeedbackRecord>>,
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn append(&self, record: &FeedbackRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FeedbackRecord>> {
        Ok(self.records.lock().await.clone())
    }
}
