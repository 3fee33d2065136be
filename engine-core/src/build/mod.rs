//! The build pipeline runtime.
//!
//! Groups execute in order; builds within a group run in parallel and
//! fail-fast - the first fatal error cancels the group's peers and skips
//! every later group. Steps tagged as continue-errors demote to warnings.

pub mod group;
pub mod spec;
pub mod step;
pub mod steps;

pub use group::{BuildGroup, BuildGroups};
pub use spec::{Build, BuildType, ContainerFile, EnvType};

use crate::build::step::StepContext;
use crate::config::AppConfig;
use crate::container::SESSION_LABEL_KEY;
use crate::error::is_continue;
use crate::log::{debug, failed_message, info, success_message, warning};
use crate::manager::ConcurrentManager;
use crate::runtime::Runtime;
use crate::worker::{PoolConfig, WorkerPool};
use crate::{EngineError, Result};

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Outcome of one build of a pipeline run.
#[derive(Debug)]
pub struct BuildSummary {
    pub app: String,
    pub image_uri: String,
    pub ok: bool,
    pub duration: Duration,
    pub error: Option<String>,
}

/// Drives build groups against a runtime. One pipeline owns one session id,
/// one cancellation token and one intermediate-image dedup scope.
pub struct Pipeline {
    runtime: Arc<dyn Runtime>,
    config: Arc<AppConfig>,
    session: Uuid,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Self {
            runtime,
            config: crate::config::snapshot(),
            session: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// The token the CLI wires its signal handler to.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Executes every group in order. Returns per-build summaries; the
    /// caller maps aggregate failure onto its exit code.
    pub async fn run(&self, groups: BuildGroups) -> Result<Vec<BuildSummary>> {
        let pool = Arc::new(WorkerPool::new(self.runtime.clone(), PoolConfig::default()));
        let manager = Arc::new(ConcurrentManager::new(pool, self.cancel.clone()).await?);
        let base_ctx = StepContext::new(
            self.runtime.clone(),
            self.config.clone(),
            manager.clone(),
            self.cancel.clone(),
            self.session,
        );

        let mut summaries = Vec::new();
        let mut fatal = false;

        for (index, group) in groups.into_iter().enumerate() {
            if group.is_empty() {
                continue;
            }
            if fatal {
                for build in group.builds {
                    summaries.push(BuildSummary {
                        app: build.app.clone(),
                        image_uri: build.image_uri(),
                        ok: false,
                        duration: Duration::ZERO,
                        error: Some("skipped after earlier group failure".to_string()),
                    });
                }
                continue;
            }

            debug!("running group {} with {} builds", index + 1, group.len());
            let group_cancel = self.cancel.child_token();
            let ctx = base_ctx.with_cancel(group_cancel.clone());

            let mut tasks = FuturesUnordered::new();
            for build in group.builds {
                let ctx = ctx.clone();
                tasks.push(tokio::spawn(async move {
                    let started = Instant::now();
                    let (app, image_uri, result) = run_build(&ctx, build).await;
                    (app, image_uri, started.elapsed(), result)
                }));
            }

            while let Some(joined) = tasks.next().await {
                let (app, image_uri, duration, result) = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        fatal = true;
                        group_cancel.cancel();
                        summaries.push(BuildSummary {
                            app: "unknown".to_string(),
                            image_uri: String::new(),
                            ok: false,
                            duration: Duration::ZERO,
                            error: Some(format!("build task panicked - {}", e)),
                        });
                        continue;
                    }
                };

                match result {
                    Ok(()) => {
                        info!("build {} succeeded in {:.1}s", app, duration.as_secs_f32());
                        summaries.push(BuildSummary {
                            app,
                            image_uri,
                            ok: true,
                            duration,
                            error: None,
                        });
                    }
                    Err(err) => {
                        fatal = true;
                        group_cancel.cancel();
                        summaries.push(BuildSummary {
                            app,
                            image_uri,
                            ok: false,
                            duration,
                            error: Some(format!("{:#}", err)),
                        });
                    }
                }
            }

            ctx.join_pumps().await;
        }

        if let Err(e) = self
            .runtime
            .prune_containers(SESSION_LABEL_KEY, &self.session.to_string())
            .await
        {
            warning!("failed to clean up session containers - {}", e);
        }

        manager.shutdown().await;
        Ok(summaries)
    }
}

/// Runs one build's step DAG: synchronous steps inline in declaration
/// order, async steps alongside their peers, all joined before the build is
/// declared done.
async fn run_build(ctx: &StepContext, mut build: Build) -> (String, String, Result<()>) {
    build.defaults();
    let app = build.app.clone();
    let image_uri = build.image_uri();

    if let Err(err) = build.validate() {
        return (app, image_uri, Err(err));
    }
    let build_type = match build.build_type {
        Some(build_type) => build_type,
        None => {
            return (
                app,
                image_uri,
                Err(EngineError::InvalidSpec("build type must be set".into()).into()),
            )
        }
    };

    let build = Arc::new(build);
    let result = drive_steps(ctx, &build, build_type).await;

    match &result {
        Ok(()) => success_message(&app, "build finished"),
        Err(err) => failed_message(&app, &format!("build failed - {:#}", err)),
    }

    (app, image_uri, result)
}

async fn drive_steps(
    ctx: &StepContext,
    build: &Arc<Build>,
    build_type: BuildType,
) -> Result<()> {
    let steps = steps::resolve(build_type);
    let mut async_tasks = FuturesUnordered::new();
    let mut outcome = Ok(());

    for step in steps {
        if ctx.cancel.is_cancelled() {
            outcome = Err(EngineError::Cancelled.into());
            break;
        }

        for intermediate in step.intermediate_images(build, &ctx.config) {
            if let Err(err) = ctx.ensure_intermediate(&intermediate).await {
                outcome = Err(err);
                break;
            }
        }
        if outcome.is_err() {
            break;
        }

        if step.is_async() {
            let ctx = ctx.clone();
            let build = build.clone();
            let name = step.name().to_string();
            async_tasks.push(tokio::spawn(async move {
                let result = tokio::select! {
                    res = step.run(&ctx, &build) => res,
                    _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled.into()),
                };
                (name, result)
            }));
        } else {
            debug!("running step {} for {}", step.name(), build.app);
            let result = tokio::select! {
                res = step.run(ctx, build) => res,
                _ = ctx.cancel.cancelled() => Err(EngineError::Cancelled.into()),
            };
            if let Err(err) = result {
                if is_continue(&err) {
                    warning!("step {} of {} - {:#}", step.name(), build.app, err);
                } else {
                    outcome = Err(err);
                    break;
                }
            }
        }
    }

    // async peers are joined regardless of the synchronous outcome so no
    // step task leaks past its build
    while let Some(joined) = async_tasks.next().await {
        match joined {
            Ok((name, Err(err))) => {
                if is_continue(&err) {
                    warning!("step {} of {} - {:#}", name, build.app, err);
                } else if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
            Ok((_, Ok(()))) => {}
            Err(e) => {
                if outcome.is_ok() {
                    outcome = Err(anyhow!("step task panicked - {}", e));
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::spec::BuildType;
    use crate::runtime::fake::FakeRuntime;
    use pretty_assertions::assert_eq;

    fn service(app: &str) -> Build {
        let mut build = Build::new(app, BuildType::GoLang, app);
        build.image_tag = "sha1234".to_string();
        build
    }

    fn pipeline(fake: &Arc<FakeRuntime>) -> Pipeline {
        let runtime: Arc<dyn Runtime> = fake.clone();
        Pipeline::new(runtime)
    }

    #[tokio::test]
    async fn groups_run_sequentially_builds_in_parallel() {
        let fake = Arc::new(FakeRuntime::new());
        let pipeline = pipeline(&fake);

        let groups = BuildGroups::new(vec![
            BuildGroup::new(vec![service("x")]),
            BuildGroup::new(vec![service("y"), service("z")]),
        ]);

        let summaries = pipeline.run(groups).await.unwrap();
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.ok), "{:?}", summaries);

        // one compile container per build
        assert_eq!(fake.call_count("create"), 3);

        // group one finished before group two created anything
        let calls = fake.calls();
        let x_create = calls
            .iter()
            .position(|c| c.starts_with("create x-compile"))
            .unwrap();
        let y_create = calls
            .iter()
            .position(|c| c.starts_with("create y-compile"))
            .unwrap();
        let z_create = calls
            .iter()
            .position(|c| c.starts_with("create z-compile"))
            .unwrap();
        assert!(x_create < y_create && x_create < z_create);

        // final application images pushed
        assert_eq!(fake.call_count("push x:sha1234"), 1);
        assert_eq!(fake.call_count("push y:sha1234"), 1);
        assert_eq!(fake.call_count("push z:sha1234"), 1);
    }

    #[tokio::test]
    async fn intermediate_pull_beats_build_and_runs_once() {
        let fake = Arc::new(FakeRuntime::new());
        let pipeline = pipeline(&fake);

        // two golang builds share one toolchain fingerprint
        let groups = BuildGroups::single(vec![service("a"), service("b")]);
        let summaries = pipeline.run(groups).await.unwrap();
        assert!(summaries.iter().all(|s| s.ok), "{:?}", summaries);

        // pulled, never built, and only once for the shared fingerprint
        let intermediate_pulls = fake
            .calls()
            .iter()
            .filter(|c| c.starts_with("pull containifyci/golang-builder:"))
            .count();
        assert_eq!(intermediate_pulls, 1);
        assert_eq!(fake.call_count("build containifyci/golang-builder:"), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_fails_fast_and_cancels_peers() {
        let fake = Arc::new(FakeRuntime::new());
        fake.set_wait_status_by_name("bad-compile", Some(2));
        fake.set_wait_delay_by_name("slow-compile", Duration::from_secs(30));
        let pipeline = pipeline(&fake);

        let mut bad = service("bad");
        bad.custom
            .insert("build-script".into(), vec!["exit 2".into()]);
        let slow = service("slow");

        let groups = BuildGroups::new(vec![
            BuildGroup::new(vec![bad, slow]),
            BuildGroup::new(vec![service("never")]),
        ]);

        let started = Instant::now();
        let summaries = pipeline.run(groups).await.unwrap();
        // fail-fast: the slow peer was cancelled, nowhere near 30s
        assert!(started.elapsed() < Duration::from_secs(10));

        let bad_summary = summaries.iter().find(|s| s.app == "bad").unwrap();
        assert!(!bad_summary.ok);
        assert!(bad_summary.error.as_deref().unwrap().contains("status 2"));

        let slow_summary = summaries.iter().find(|s| s.app == "slow").unwrap();
        assert!(!slow_summary.ok);

        // the second group was skipped entirely
        let never_summary = summaries.iter().find(|s| s.app == "never").unwrap();
        assert!(!never_summary.ok);
        assert!(never_summary.error.as_deref().unwrap().contains("skipped"));
        assert_eq!(fake.call_count("create never"), 0);
    }

    #[tokio::test]
    async fn lint_failures_demote_to_warnings() {
        let fake = Arc::new(FakeRuntime::new());
        fake.set_wait_status_by_name("warny-lint", Some(1));
        let pipeline = pipeline(&fake);

        let mut build = service("warny");
        build.custom.insert("lint-script".into(), vec!["run lint".into()]);

        let summaries = pipeline.run(BuildGroups::single(vec![build])).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].ok, "{:?}", summaries);
    }

    #[tokio::test]
    async fn session_containers_are_pruned_after_the_run() {
        let fake = Arc::new(FakeRuntime::new());
        let pipeline = pipeline(&fake);
        let session = pipeline.session().to_string();

        pipeline
            .run(BuildGroups::single(vec![service("p")]))
            .await
            .unwrap();

        assert_eq!(
            fake.call_count(&format!("prune {}={}", SESSION_LABEL_KEY, session)),
            1
        );
    }
}
