// src/store/mod.rs
//
// Persistence collaborators. The engine only sees these traits; the backend is
// chosen from `StoreConfig` at startup.
pub mod fs;
pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::artifact::{ArtifactBlob, ArtifactMeta};
use crate::feedback::FeedbackRecord;
use crate::utils::config::{StoreBackend, StoreConfig};

/// Versioned artifact storage. `put` never overwrites an existing version.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, blob: &ArtifactBlob) -> Result<()>;
    async fn get(&self, version: u64) -> Result<Option<ArtifactBlob>>;
    /// Headers of every stored version, ascending.
    async fn list(&self) -> Result<Vec<ArtifactMeta>>;
    /// Records which stored version is served, so a restart keeps a rollback.
    async fn set_active(&self, version: u64) -> Result<()>;
    async fn active(&self) -> Result<Option<u64>>;
}

/// Append-only feedback log.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn append(&self, record: &FeedbackRecord) -> Result<()>;
    /// Every record, in append order.
    async fn list(&self) -> Result<Vec<FeedbackRecord>>;
}

pub struct Stores {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub feedback: Arc<dyn FeedbackStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            artifacts: Arc::new(memory::MemoryArtifactStore::default()),
            feedback: Arc::new(memory::MemoryFeedbackStore::default()),
        }
    }
}

/// Opens the configured backend.
pub async fn open(config: &StoreConfig) -> Result<Stores> {
    Ok(match config.backend {
        StoreBackend::Memory => Stores::in_memory(),
        StoreBackend::Filesystem => Stores {
            artifacts: Arc::new(fs::FsArtifactStore::open(&config.models_dir).await?),
            feedback: Arc::new(fs::FsFeedbackStore::open(&config.feedback_path).await?),
        },
        StoreBackend::Postgres => {
            let pool = crate::utils::db_connect::connect().await?;
            let store = Arc::new(postgres::PgStore::new(pool));
            store.ensure_schema().await?;
            Stores {
                artifacts: store.clone(),
                feedback: store,
            }
        }
    })
}
