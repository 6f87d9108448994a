// src/store/postgres.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use serde_json::Value as JsonValue;

use super::{ArtifactStore, FeedbackStore};
use crate::artifact::{ArtifactBlob, ArtifactMeta};
use crate::feedback::FeedbackRecord;
use crate::utils::db_connect::PgPool;

const SCHEMA_DDL: &str = "
CREATE SCHEMA IF NOT EXISTS credit_scoring;
CREATE TABLE IF NOT EXISTS credit_scoring.model_artifacts (
    version BIGINT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL,
    schema_version TEXT NOT NULL,
    checksum TEXT NOT NULL,
    payload BYTEA NOT NULL
);
CREATE TABLE IF NOT EXISTS credit_scoring.model_active (
    singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
    version BIGINT NOT NULL REFERENCES credit_scoring.model_artifacts (version),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE TABLE IF NOT EXISTS credit_scoring.feedback (
    seq BIGSERIAL PRIMARY KEY,
    id UUID NOT NULL UNIQUE,
    recorded_at TIMESTAMPTZ NOT NULL,
    record JSONB NOT NULL
);
";

/// Artifacts as `BYTEA` rows, feedback as `JSONB` rows, both under `credit_scoring`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        conn.batch_execute(SCHEMA_DDL)
            .await
            .context("Failed to create credit_scoring tables")?;
        info!("🗄️ credit_scoring tables ready");
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for PgStore {
    async fn put(&self, blob: &ArtifactBlob) -> Result<()> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        conn.execute(
            "INSERT INTO credit_scoring.model_artifacts (version, created_at, schema_version, checksum, payload)
             VALUES ($1, $2, $3, $4, $5)",
            &[
                &(blob.meta.version as i64),
                &blob.meta.created_at,
                &blob.meta.schema_version,
                &blob.meta.checksum,
                &blob.bytes,
            ],
        )
        .await
        .with_context(|| format!("Failed to insert model v{}", blob.meta.version))?;
        Ok(())
    }

    async fn get(&self, version: u64) -> Result<Option<ArtifactBlob>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt(
                "SELECT version, created_at, schema_version, checksum, payload
                 FROM credit_scoring.model_artifacts WHERE version = $1",
                &[&(version as i64)],
            )
            .await
            .with_context(|| format!("Failed to load model v{}", version))?;
        Ok(row.map(|row| ArtifactBlob {
            meta: ArtifactMeta {
                version: row.get::<_, i64>(0) as u64,
                created_at: row.get(1),
                schema_version: row.get(2),
                checksum: row.get(3),
            },
            bytes: row.get(4),
        }))
    }

    async fn list(&self) -> Result<Vec<ArtifactMeta>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query(
                "SELECT version, created_at, schema_version, checksum
                 FROM credit_scoring.model_artifacts ORDER BY version ASC",
                &[],
            )
            .await
            .context("Failed to list model versions")?;
        Ok(rows
            .iter()
            .map(|row| ArtifactMeta {
                version: row.get::<_, i64>(0) as u64,
                created_at: row.get(1),
                schema_version: row.get(2),
                checksum: row.get(3),
            })
            .collect())
    }

    async fn set_active(&self, version: u64) -> Result<()> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        conn.execute(
            "INSERT INTO credit_scoring.model_active (singleton, version) VALUES (TRUE, $1)
             ON CONFLICT (singleton) DO UPDATE SET version = EXCLUDED.version, updated_at = NOW()",
            &[&(version as i64)],
        )
        .await
        .with_context(|| format!("Failed to mark model v{} active", version))?;
        Ok(())
    }

    async fn active(&self) -> Result<Option<u64>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let row = conn
            .query_opt("SELECT version FROM credit_scoring.model_active WHERE singleton", &[])
            .await
            .context("Failed to read the active model version")?;
        Ok(row.map(|row| row.get::<_, i64>(0) as u64))
    }
}

#[async_trait]
impl FeedbackStore for PgStore {
    async fn append(&self, record: &FeedbackRecord) -> Result<()> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let json = serde_json::to_value(record).context("Failed to serialize feedback record")?;
        conn.execute(
            "INSERT INTO credit_scoring.feedback (id, recorded_at, record) VALUES ($1, $2, $3)",
            &[&record.id, &record.recorded_at, &json],
        )
        .await
        .context("Failed to insert feedback record")?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<FeedbackRecord>> {
        let conn = self.pool.get().await.context("Failed to get DB connection")?;
        let rows = conn
            .query("SELECT id, record FROM credit_scoring.feedback ORDER BY seq ASC", &[])
            .await
            .context("Failed to load feedback records")?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: JsonValue = row.get(1);
            match serde_json::from_value::<FeedbackRecord>(json) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let id: uuid::Uuid = row.get(0);
                    warn!("⚠️ Skipping unreadable feedback record {}: {}", id, e);
                }
            }
        }
        Ok(records)
    }
}
