use crate::build::spec::{Build, BuildType};
use crate::config::AppConfig;
use crate::image::{self, IntermediateImage};
use crate::manager::ConcurrentManager;
use crate::runtime::Runtime;
use crate::Result;

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shared state a step runs against. The fingerprint set and the log-pump
/// supervisor are pipeline-wide; the cancellation token is scoped to the
/// build's group.
#[derive(Clone)]
pub struct StepContext {
    pub runtime: Arc<dyn Runtime>,
    pub config: Arc<AppConfig>,
    pub manager: Arc<ConcurrentManager>,
    pub cancel: CancellationToken,
    pub session: Uuid,
    fingerprints: Arc<Mutex<HashSet<String>>>,
    pumps: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StepContext {
    pub fn new(
        runtime: Arc<dyn Runtime>,
        config: Arc<AppConfig>,
        manager: Arc<ConcurrentManager>,
        cancel: CancellationToken,
        session: Uuid,
    ) -> Self {
        Self {
            runtime,
            config,
            manager,
            cancel,
            session,
            fingerprints: Arc::new(Mutex::new(HashSet::new())),
            pumps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Clone for a different group: same pipeline-wide state, new token.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Runs the intermediate-image cache protocol at most once per
    /// fingerprint for this pipeline.
    pub async fn ensure_intermediate(&self, intermediate: &IntermediateImage) -> Result<()> {
        {
            let done = self.fingerprints.lock().await;
            if done.contains(&intermediate.fingerprint) {
                return Ok(());
            }
        }
        image::ensure(&self.runtime, intermediate, &self.cancel).await?;
        self.fingerprints
            .lock()
            .await
            .insert(intermediate.fingerprint.clone());
        Ok(())
    }

    /// Registers a detached log pump with the pipeline's supervisor.
    pub async fn adopt_pump(&self, pump: Option<JoinHandle<()>>) {
        if let Some(pump) = pump {
            self.pumps.lock().await.push(pump);
        }
    }

    /// Joins every log pump started so far. Called by the pipeline between
    /// groups so pumps never leak across builds.
    pub async fn join_pumps(&self) {
        let mut pumps = self.pumps.lock().await;
        for pump in pumps.drain(..) {
            let _ = pump.await;
        }
    }
}

/// One stage of a build's DAG.
#[async_trait]
pub trait BuildStep: Send + Sync {
    fn name(&self) -> &str;

    fn alias(&self) -> &str {
        self.name()
    }

    /// Async steps may run alongside their peers; synchronous steps block
    /// the build until they complete.
    fn is_async(&self) -> bool {
        false
    }

    fn build_type(&self) -> BuildType;

    /// The intermediate images this step needs before it can run.
    fn intermediate_images(&self, _build: &Build, _config: &AppConfig) -> Vec<IntermediateImage> {
        Vec::new()
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()>;
}
