//! Built-in stage handlers
//!
//! Only `INGEST` does real work here: it stages the recording into a
//! per-artifact work directory. Every other known stage is a pass-through
//! placeholder for an external implementation.

use anyhow::{bail, Context};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::jobs::{StageContext, StageHandler, StageRegistry};
use crate::models::{Stage, StageParams};

/// Copies `calls_dir/<artifact>` to `work_dir/<artifact>/<artifact>`
pub struct IngestStage {
    calls_dir: PathBuf,
    work_dir: PathBuf,
}

impl IngestStage {
    pub fn new(calls_dir: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            calls_dir,
            work_dir,
        }
    }

    /// Destination path for an artifact's working copy
    pub fn work_path(&self, artifact_id: &str) -> PathBuf {
        self.work_dir.join(artifact_id).join(artifact_id)
    }
}

/// Artifact ids are bare file names; anything that could escape a directory
/// is refused.
fn validate_artifact_id(artifact_id: &str) -> anyhow::Result<()> {
    let path = Path::new(artifact_id);
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(()),
        _ => bail!("invalid artifact id {:?}", artifact_id),
    }
}

#[async_trait]
impl StageHandler for IngestStage {
    async fn run(
        &self,
        ctx: StageContext,
        artifact_id: String,
        _params: StageParams,
    ) -> anyhow::Result<()> {
        validate_artifact_id(&artifact_id)?;

        let source = self.calls_dir.join(&artifact_id);
        let dest = self.work_path(&artifact_id);
        let dest_dir = self.work_dir.join(&artifact_id);

        tokio::fs::create_dir_all(&dest_dir)
            .await
            .with_context(|| format!("creating {}", dest_dir.display()))?;

        if ctx.is_cancelled() {
            bail!("cancelled before copy");
        }

        let bytes = tokio::fs::copy(&source, &dest)
            .await
            .with_context(|| format!("copying {} to {}", source.display(), dest.display()))?;

        ctx.log(format!("copied {} bytes to {}", bytes, dest.display()))
            .await;
        Ok(())
    }
}

/// Logs the invocation and succeeds
pub struct PassthroughStage;

#[async_trait]
impl StageHandler for PassthroughStage {
    async fn run(
        &self,
        ctx: StageContext,
        artifact_id: String,
        params: StageParams,
    ) -> anyhow::Result<()> {
        debug!(job_id = ctx.job_id, stage = %ctx.stage, artifact_id = %artifact_id, "Pass-through stage");
        ctx.log(format!(
            "{} pass-through for {} ({} params)",
            ctx.stage,
            artifact_id,
            params.values.len()
        ))
        .await;
        Ok(())
    }
}

/// Registry with every known stage wired
pub fn build_registry(config: &PipelineConfig) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register(
        Stage::Ingest,
        Arc::new(IngestStage::new(config.calls_dir.clone(), config.work_dir.clone())),
    );

    let passthrough: Arc<dyn StageHandler> = Arc::new(PassthroughStage);
    for stage in Stage::ALL.iter().filter(|s| **s != Stage::Ingest) {
        registry.register(*stage, Arc::clone(&passthrough));
    }

    registry
}
