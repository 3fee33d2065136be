//! One container's lifecycle and its blocking operations.

use crate::build::spec::Build;
use crate::image::{self, IntermediateImage};
use crate::log::{debug, failed_message, info, success_message, trace};
use crate::runtime::auth::{ImageRef, RegistryAuth};
use crate::runtime::{CommitOpts, CreateOpts, ExecOpts, Output, PlatformSpec, Runtime};
use crate::{EngineError, ErrContext, Result};

use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub static SESSION_LABEL_KEY: &str = "org.containifyci.session";
pub static SCRIPT_PATH: &str = "/tmp/script.sh";
pub static SECRETS_PATH: &str = "/tmp/secrets.sh";
pub static HOST_ENV_VAR: &str = "CONTAINIFYCI_HOST";
pub static FOLDER_ENV_VAR: &str = "CONTAINIFYCI_FOLDER";

/// The log-stream tag: `[id[0:6] (image:tag[0:8])]`.
pub fn log_prefix(id: &str, image_uri: &str) -> String {
    let id_part: String = id.chars().take(6).collect();
    let reference = ImageRef::parse(image_uri);
    let tag_part: String = reference.tag.chars().take(8).collect();
    format!("[{} ({}:{})]", id_part, reference.name, tag_part)
}

/// A pending or running container. Exclusively owns its backend container id
/// and holds its build descriptor; the descriptor is immutable at this point.
pub struct Container {
    id: Option<String>,
    name: String,
    prefix: String,
    opts: CreateOpts,
    build: Arc<Build>,
    runtime: Arc<dyn Runtime>,
    log_pump: Option<JoinHandle<()>>,
}

impl Container {
    pub fn new(runtime: Arc<dyn Runtime>, build: Arc<Build>, opts: CreateOpts) -> Self {
        let name = opts
            .get_name()
            .map(str::to_string)
            .unwrap_or_else(|| crate::runtime::fix_name(&build.app));
        let prefix = log_prefix("", opts.image_ref());

        Self {
            id: None,
            name,
            prefix,
            opts,
            build,
            runtime,
            log_pump: None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn image(&self) -> &str {
        self.opts.image_ref()
    }

    fn auth(&self) -> Option<RegistryAuth> {
        let reference = ImageRef::parse(self.opts.image_ref());
        RegistryAuth::find(&self.build.registries, &reference)
    }

    /// Creates the backend container, adopting an existing one with the same
    /// name instead of re-creating it. The platform is materialised from the
    /// build when the caller left it open, and the engine's own env entries
    /// are appended before creation.
    pub async fn create(&mut self) -> Result<&str> {
        if let Some(existing) = self.lookup_by_name().await? {
            debug!("adopting existing container {} ({})", self.name, existing);
            self.id = Some(existing);
            self.prefix = log_prefix(self.id.as_deref().unwrap_or(""), self.opts.image_ref());
            return Ok(self.id.as_deref().unwrap());
        }

        let mut opts = self.opts.clone().name(self.name.clone());
        if opts.get_platform().is_none() {
            if let Some(platform) = &self.build.platform {
                opts = opts.platform(platform.container.clone());
            }
        }
        opts = opts
            .env_entry(
                HOST_ENV_VAR,
                std::env::var(HOST_ENV_VAR).unwrap_or_else(|_| "localhost".to_string()),
            )
            .env_entry(FOLDER_ENV_VAR, self.build.folder.clone());

        let auth = self.auth();
        let id = self
            .runtime
            .create_container(opts, auth.as_ref())
            .await
            .with_context(|| format!("failed to create container for {}", self.image()))?;

        self.prefix = log_prefix(&id, self.opts.image_ref());
        self.id = Some(id);
        Ok(self.id.as_deref().unwrap())
    }

    async fn lookup_by_name(&self) -> Result<Option<String>> {
        let containers = self.runtime.container_list(true).await?;
        Ok(containers
            .into_iter()
            .find(|c| c.names.iter().any(|n| n == &self.name))
            .map(|c| c.id))
    }

    fn require_id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .ok_or_else(|| anyhow!("container `{}` was not created yet", self.name))
    }

    /// Starts the container and detaches a pump that forwards its log lines
    /// to the aggregator under this container's prefix. The pump runs until
    /// the container's stream ends and is joined by the pipeline supervisor.
    pub async fn start(&mut self) -> Result<()> {
        let id = self.require_id()?.to_string();
        self.runtime.start_container(&id).await?;
        info!("started container {}", self.prefix);

        let runtime = self.runtime.clone();
        let prefix = self.prefix.clone();
        self.log_pump = Some(tokio::spawn(async move {
            if let Err(e) = runtime.stream_logs(&id, &prefix, true, true).await {
                trace!("log pump for {} ended - {}", prefix, e);
            }
        }));

        Ok(())
    }

    /// Hands the detached log pump to the caller for joining.
    pub fn take_log_pump(&mut self) -> Option<JoinHandle<()>> {
        self.log_pump.take()
    }

    /// Blocks until the container exits. A missing status code is a hard
    /// error; a non-zero status is a structured failure carrying the image
    /// and code. Never terminates the process.
    pub async fn wait(&self) -> Result<()> {
        let id = self.require_id()?;
        let status = self.runtime.wait_container(id).await?;

        match status {
            None => {
                failed_message(&self.prefix, "container reported no exit status");
                Err(anyhow!(
                    "container `{}` running `{}` was signalled and reported no status",
                    self.name,
                    self.image()
                ))
            }
            Some(0) => {
                success_message(&self.prefix, "done");
                Ok(())
            }
            Some(code) => {
                failed_message(&self.prefix, &format!("exited with status {}", code));
                Err(EngineError::NonZeroExit {
                    image: self.image().to_string(),
                    code,
                }
                .into())
            }
        }
    }

    pub async fn stop(&self, signal: Option<&str>) -> Result<()> {
        let id = self.require_id()?;
        self.runtime.stop_container(id, signal).await
    }

    pub async fn remove(&self) -> Result<()> {
        let id = self.require_id()?;
        self.runtime.remove_container(id).await
    }

    pub async fn exec(&self, opts: ExecOpts<'_>) -> Result<Output<String>> {
        let id = self.require_id()?;
        self.runtime.exec_container(id, opts, &self.prefix).await
    }

    pub async fn copy_content(&self, content: &[u8], dest: &Path) -> Result<()> {
        let id = self.require_id()?;
        self.runtime
            .copy_content_to_container(id, content, dest)
            .await
    }

    pub async fn copy_dir(&self, source: &Path, dest: &Path) -> Result<()> {
        let id = self.require_id()?;
        self.runtime.copy_dir_to_container(id, source, dest).await
    }

    pub async fn copy_file_from(&self, source: &Path) -> Result<String> {
        let id = self.require_id()?;
        self.runtime.copy_file_from_container(id, source).await
    }

    pub async fn commit(&self, opts: &CommitOpts) -> Result<String> {
        let id = self.require_id()?;
        self.runtime.commit_container(id, opts).await
    }

    /// Ensures the image is present locally, pulling it when missing. The
    /// pull is the retry-safe operation, so transient failures back off and
    /// retry.
    pub async fn pull(&self) -> Result<()> {
        let image = self.image().to_string();
        if !self.runtime.list_image(&image).await?.is_empty() {
            return Ok(());
        }
        let auth = self.auth();
        crate::manager::pull_with_retry(
            &self.runtime,
            &image,
            auth.as_ref(),
            crate::manager::DEFAULT_MAX_RETRIES,
            std::time::Duration::from_secs(1),
            &CancellationToken::new(),
        )
        .await
    }

    /// Like [`Container::pull`] but re-pulls when the local copy does not
    /// match the requested platform.
    pub async fn pull_by_platform(&self, platform: &PlatformSpec) -> Result<()> {
        let image = self.image().to_string();
        let auth = self.auth();

        match self.runtime.inspect_image(&image).await {
            Ok(info) if info.matches_platform(platform) => Ok(()),
            Ok(_) => {
                debug!("local {} has wrong platform, re-pulling", image);
                image::pull_by_platform(&self.runtime, &image, platform, auth.as_ref()).await
            }
            Err(err) => match EngineError::from_err(&err) {
                Some(EngineError::NotFound(_)) => {
                    image::pull_by_platform(&self.runtime, &image, platform, auth.as_ref()).await
                }
                _ => Err(err),
            },
        }
    }

    /// Runs the intermediate-image cache protocol for this build.
    pub async fn build_intermediate_container(
        &self,
        image: &IntermediateImage,
        cancel: &CancellationToken,
    ) -> Result<()> {
        image::ensure(&self.runtime, image, cancel).await
    }
}

/// Options for the canonical "run a script in a container" operation.
#[derive(Clone, Debug, Default)]
pub struct ScriptOpts {
    pub image: String,
    pub name: String,
    /// Opaque script content, copied to [`SCRIPT_PATH`].
    pub script: Vec<u8>,
    /// Names of secrets exported to the container through a generated
    /// `secrets.sh`; values resolve from the process environment.
    pub secrets: Vec<String>,
    pub env: Vec<(String, String)>,
    pub volumes: Vec<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub session: Option<String>,
}

/// Creates a container running `sh /tmp/script.sh`, copies the script (and
/// the optional secrets export file) into it, starts it and waits for
/// completion. Any stage failure propagates as an error.
pub async fn building_container(
    runtime: Arc<dyn Runtime>,
    build: Arc<Build>,
    opts: ScriptOpts,
) -> Result<Container> {
    let mut create = CreateOpts::new(&opts.image)
        .name(crate::runtime::fix_name(&opts.name))
        .cmd(["sh", SCRIPT_PATH])
        .env(opts.env.clone());
    if !opts.volumes.is_empty() {
        create = create.volumes(opts.volumes.clone());
    }
    if let Some(working_dir) = &opts.working_dir {
        create = create.working_dir(working_dir);
    }
    if let Some(user) = &opts.user {
        create = create.user(user);
    }
    if let Some(session) = &opts.session {
        create = create.label(SESSION_LABEL_KEY, session);
    }

    let mut container = Container::new(runtime, build, create);
    container.create().await?;
    container
        .copy_content(&opts.script, Path::new(SCRIPT_PATH))
        .await
        .context("failed to copy build script into container")?;

    if !opts.secrets.is_empty() {
        let exports = secrets_script(&opts.secrets);
        container
            .copy_content(exports.as_bytes(), Path::new(SECRETS_PATH))
            .await
            .context("failed to copy secrets into container")?;
    }

    container.start().await?;
    container.wait().await?;
    Ok(container)
}

/// Builds the `secrets.sh` export script. Values come from the environment;
/// the generated content is never logged.
fn secrets_script(names: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    for name in names {
        let value = std::env::var(name).unwrap_or_default();
        script.push_str(&format!("export {}='{}'\n", name, value.replace('\'', "'\\''")));
    }
    script
}
