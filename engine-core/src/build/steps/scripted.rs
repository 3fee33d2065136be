//! The staged builder shared by every compiled or scripted build type:
//! pull base images, ensure the toolchain intermediate, compile, test,
//! lint, scan, package and push.

use crate::build::spec::{Build, BuildType};
use crate::build::step::{BuildStep, StepContext};
use crate::config::{AppConfig, PullPolicy};
use crate::container::{building_container, ScriptOpts};
use crate::error::continue_on;
use crate::image::IntermediateImage;
use crate::log::{debug, info};
use crate::manager::{push_with_retry, PullRequest, DEFAULT_MAX_RETRIES};
use crate::oneshot::{self, OneShotCtx};
use crate::runtime::auth::{ImageRef, RegistryAuth};
use crate::runtime::CreateOpts;
use crate::{ErrContext, Result};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// The toolchain image a build compiles inside.
pub fn language_intermediate(build: &Build, config: &AppConfig) -> IntermediateImage {
    let build_type = build.build_type.unwrap_or(BuildType::Generic);
    let language = config.language(build_type);

    let dockerfile = build
        .container_files
        .get("intermediate")
        .map(|f| f.content.clone().into_bytes())
        .unwrap_or_else(|| {
            format!(
                "FROM {}\nWORKDIR {}\n",
                language.base_image, language.mount_path
            )
            .into_bytes()
        });

    let platforms = build
        .platform
        .as_ref()
        .map(|p| vec![p.container.clone()])
        .unwrap_or_default();

    let image = IntermediateImage::new(
        &build.containify_registry,
        &format!("{}-builder", build_type.as_ref()),
        dockerfile,
        platforms,
    );
    let auth = RegistryAuth::find(&build.registries, &ImageRef::parse(&image.tag));
    image.auth(auth)
}

/// The opaque script for one stage, if the descriptor carries one.
fn stage_script(build: &Build, stage: &str) -> Option<Vec<u8>> {
    build
        .container_files
        .get(stage)
        .map(|f| f.content.clone().into_bytes())
        .or_else(|| {
            build
                .custom_string(&format!("{}-script", stage))
                .map(|s| s.as_bytes().to_vec())
        })
}

fn script_opts(build: &Build, config: &AppConfig, image: &str, stage: &str, script: Vec<u8>) -> ScriptOpts {
    let build_type = build.build_type.unwrap_or(BuildType::Generic);
    let language = config.language(build_type);

    let mut volumes = config.container.volumes.clone();
    volumes.push(format!("{}:{}", build.folder, language.mount_path));

    ScriptOpts {
        image: image.to_string(),
        name: format!("{}-{}", build.app, stage),
        script,
        secrets: build.custom_strings("secrets").to_vec(),
        env: vec![("CONTAINIFYCI_APP".to_string(), build.app.clone())],
        volumes,
        working_dir: Some(language.mount_path),
        user: config
            .security
            .create_non_root_user
            .then(|| config.security.username.clone()),
        session: None,
    }
}

// ################################################################################

pub struct PullBaseImages {
    build_type: BuildType,
}

impl PullBaseImages {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for PullBaseImages {
    fn name(&self) -> &str {
        "pull-base-images"
    }

    fn alias(&self) -> &str {
        "pull"
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        if ctx.config.container.pull_policy == PullPolicy::Never {
            debug!("pull policy is never, skipping base image pulls");
            return Ok(());
        }

        let language = ctx.config.language(self.build_type);
        let mut images = vec![language.base_image.clone()];
        if !language.lint_image.is_empty() && language.lint_image != language.base_image {
            images.push(language.lint_image.clone());
        }

        let mut requests = Vec::new();
        for image in images.into_iter().filter(|i| !i.is_empty()) {
            if ctx.config.container.pull_policy == PullPolicy::IfNotPresent
                && !ctx.runtime.list_image(&image).await?.is_empty()
            {
                continue;
            }
            let auth = RegistryAuth::find(&build.registries, &ImageRef::parse(&image));
            requests.push(PullRequest { image, auth });
        }
        if requests.is_empty() {
            return Ok(());
        }

        let mut results = ctx.manager.pull_images_parallel(requests);
        let mut failed = None;
        while let Some(result) = results.recv().await {
            if let Err(err) = result.result {
                failed.get_or_insert_with(|| {
                    err.context(format!("failed to pull base image `{}`", result.id))
                });
            }
        }
        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub struct IntermediateStep {
    build_type: BuildType,
}

impl IntermediateStep {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for IntermediateStep {
    fn name(&self) -> &str {
        "intermediate-image"
    }

    fn alias(&self) -> &str {
        "intermediate"
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    fn intermediate_images(&self, build: &Build, config: &AppConfig) -> Vec<IntermediateImage> {
        vec![language_intermediate(build, config)]
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        for intermediate in self.intermediate_images(build, &ctx.config) {
            ctx.ensure_intermediate(&intermediate).await?;
        }
        Ok(())
    }
}

pub struct CompileStep {
    build_type: BuildType,
}

impl CompileStep {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for CompileStep {
    fn name(&self) -> &str {
        "compile"
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        let script = stage_script(build, "build").unwrap_or_else(|| {
            format!("#!/bin/sh\nset -e\necho \"nothing to compile for {}\"\n", build.app)
                .into_bytes()
        });
        let image = language_intermediate(build, &ctx.config);

        let mut opts = script_opts(build, &ctx.config, &image.tag, "compile", script);
        opts.session = Some(ctx.session.to_string());

        let mut container =
            building_container(ctx.runtime.clone(), build.clone(), opts).await?;
        ctx.adopt_pump(container.take_log_pump()).await;
        container.remove().await?;
        Ok(())
    }
}

pub struct TestStep {
    build_type: BuildType,
}

impl TestStep {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for TestStep {
    fn name(&self) -> &str {
        "test"
    }

    fn is_async(&self) -> bool {
        true
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        let script = match stage_script(build, "test") {
            Some(script) => script,
            None => {
                debug!("no test script for {}, skipping", build.app);
                return Ok(());
            }
        };
        let image = language_intermediate(build, &ctx.config);

        let mut opts = script_opts(build, &ctx.config, &image.tag, "test", script);
        opts.session = Some(ctx.session.to_string());

        let mut container =
            building_container(ctx.runtime.clone(), build.clone(), opts).await?;
        ctx.adopt_pump(container.take_log_pump()).await;
        container.remove().await?;
        Ok(())
    }
}

pub struct LintStep {
    build_type: BuildType,
}

impl LintStep {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for LintStep {
    fn name(&self) -> &str {
        "lint"
    }

    fn is_async(&self) -> bool {
        true
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        let script = match stage_script(build, "lint") {
            Some(script) => script,
            None => return Ok(()),
        };
        let language = ctx.config.language(self.build_type);
        let image = if language.lint_image.is_empty() {
            language_intermediate(build, &ctx.config).tag
        } else {
            language.lint_image
        };

        let mut opts = script_opts(build, &ctx.config, &image, "lint", script);
        opts.session = Some(ctx.session.to_string());

        // lint findings do not fail the build
        match building_container(ctx.runtime.clone(), build.clone(), opts).await {
            Ok(mut container) => {
                ctx.adopt_pump(container.take_log_pump()).await;
                container.remove().await?;
                Ok(())
            }
            Err(err) => Err(continue_on(err.context(format!("lint of {} failed", build.app)))),
        }
    }
}

pub struct ScanStep {
    build_type: BuildType,
}

impl ScanStep {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for ScanStep {
    fn name(&self) -> &str {
        "scan"
    }

    fn is_async(&self) -> bool {
        true
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        let scanner = match &ctx.config.security.scanner {
            Some(scanner) if !scanner.image.is_empty() => scanner.clone(),
            _ => return Ok(()),
        };

        let opts = CreateOpts::new(&scanner.image).cmd([
            "scan".to_string(),
            "--severity".to_string(),
            scanner.severity.clone(),
            build.image_uri(),
        ]);

        oneshot::run(
            ctx.runtime.clone(),
            build.clone(),
            OneShotCtx::new(opts, true, true),
        )
        .await
        .map(|_| ())
        .with_context(|| format!("scan of {} failed", build.image_uri()))
    }
}

pub struct PackagePushStep {
    build_type: BuildType,
}

impl PackagePushStep {
    pub fn new(build_type: BuildType) -> Self {
        Self { build_type }
    }
}

#[async_trait]
impl BuildStep for PackagePushStep {
    fn name(&self) -> &str {
        "package-push"
    }

    fn alias(&self) -> &str {
        "push"
    }

    fn build_type(&self) -> BuildType {
        self.build_type
    }

    async fn run(&self, ctx: &StepContext, build: &Arc<Build>) -> Result<()> {
        let language = ctx.config.language(self.build_type);

        let dockerfile = build
            .container_files
            .get("package")
            .map(|f| f.content.clone().into_bytes())
            .or_else(|| {
                (!build.file.is_empty())
                    .then(|| std::fs::read(&build.file).ok())
                    .flatten()
            })
            .unwrap_or_else(|| format!("FROM {}\n", language.base_image).into_bytes());

        let reference = build.image_uri();
        ctx.runtime
            .build_image(&dockerfile, &reference)
            .await
            .with_context(|| format!("failed to build application image `{}`", reference))?;

        let auth = RegistryAuth::find(&build.registries, &ImageRef::parse(&reference));
        push_with_retry(
            &ctx.runtime,
            &reference,
            auth.as_ref(),
            DEFAULT_MAX_RETRIES,
            Duration::from_secs(1),
            &ctx.cancel,
        )
        .await
        .with_context(|| format!("failed to push `{}`", reference))?;

        info!("pushed application image {}", reference);
        Ok(())
    }
}
