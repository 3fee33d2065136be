//! Single-step role runner for AI builds. No compile pipeline - one
//! container executes the role and its output goes to the aggregator.

use crate::build::spec::{Build, BuildType};
use crate::build::step::{BuildStep, StepContext};
use crate::log::{info, log_message};
use crate::oneshot::{self, OneShotCtx};
use crate::runtime::CreateOpts;
use crate::{ErrContext, Result};

use async_trait::async_trait;
use std::sync::Arc;

static DEFAULT_RUNNER_IMAGE: &str = "containifyci/ai-runner:latest";

pub struct AIStep;

#[async_trait]
impl BuildStep for AIStep {
    fn name(&self) -> &str {
        "ai-role"
    }

    fn alias(&self) -> &str {
        "ai"
    }

    fn build_type(&self) -> BuildType {
        BuildType::AI
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        let image = build
            .custom_string("runner-image")
            .unwrap_or(DEFAULT_RUNNER_IMAGE)
            .to_string();
        let role = build.custom_string("role").unwrap_or("assistant").to_string();

        info!("running ai role `{}` for {}", role, build.app);
        let opts = CreateOpts::new(&image)
            .cmd(["run".to_string(), "--role".to_string(), role])
            .env(build.custom_strings("env").iter().filter_map(|entry| {
                entry
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            }));

        let output = oneshot::run(
            ctx.runtime.clone(),
            build.clone(),
            OneShotCtx::new(opts, true, true),
        )
        .await
        .with_context(|| format!("ai role runner for `{}` failed", build.app))?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            log_message(&build.app, line);
        }
        Ok(())
    }
}
