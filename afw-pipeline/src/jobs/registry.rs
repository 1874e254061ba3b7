//! Stage registry
//!
//! Maps a stage name to the function that performs it. Populated once at
//! startup and then shared read-only by every worker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::log_buffer::JobLogger;
use crate::models::StageParams;

/// What a running stage can see of its job
#[derive(Clone)]
pub struct StageContext {
    pub job_id: i64,
    pub stage: String,
    /// Cancelled on per-job timeout or pool shutdown; treat as a hard stop
    pub cancel: CancellationToken,
    pub logger: JobLogger,
}

impl StageContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shorthand for `ctx.logger.log(..)`
    pub async fn log(&self, line: impl Into<String>) {
        self.logger.log(line).await;
    }
}

/// A pluggable stage implementation
///
/// Must be idempotent for repeated calls with the same artifact and params,
/// and must not assume earlier stages ran in this process.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(
        &self,
        ctx: StageContext,
        artifact_id: String,
        params: StageParams,
    ) -> anyhow::Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> StageHandler for FnHandler<F>
where
    F: Fn(StageContext, String, StageParams) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(
        &self,
        ctx: StageContext,
        artifact_id: String,
        params: StageParams,
    ) -> anyhow::Result<()> {
        (self.0)(ctx, artifact_id, params).await
    }
}

#[derive(Default, Clone)]
pub struct StageRegistry {
    handlers: HashMap<String, Arc<dyn StageHandler>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `stage`
    pub fn register(&mut self, stage: impl Into<String>, handler: Arc<dyn StageHandler>) {
        self.handlers.insert(stage.into(), handler);
    }

    /// Register an async closure as a stage
    pub fn register_fn<F, Fut>(&mut self, stage: impl Into<String>, f: F)
    where
        F: Fn(StageContext, String, StageParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(stage, Arc::new(FnHandler(f)));
    }

    pub fn get(&self, stage: &str) -> Option<Arc<dyn StageHandler>> {
        self.handlers.get(stage).cloned()
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.handlers.contains_key(stage)
    }

    /// Registered stage names, sorted
    pub fn stages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
