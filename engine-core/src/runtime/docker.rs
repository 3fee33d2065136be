use crate::log::{debug, log_message, trace};
use crate::runtime::auth::{ImageRef, RegistryAuth};
use crate::runtime::opts::{
    truncate, CommitOpts, ContainerInfo, ContainerSummary, CreateOpts, ExecOpts, ImageInfo,
    Output, PlatformSpec,
};
use crate::runtime::{Runtime, RuntimeKind};
use crate::{err, EngineError, ErrContext, Error, Result};

use async_trait::async_trait;
use docker_api::{
    conn::TtyChunk,
    models::ImageBuildChunk,
    opts::{
        ContainerListOpts, ContainerPruneFilter, ContainerPruneOpts, ContainerRemoveOpts,
        ImageBuildOpts, ImagePushOpts, LogsOpts, PullOpts, TagOpts,
    },
    Docker, Exec,
};
use futures::{StreamExt, TryStreamExt};
use tempdir::TempDir;

use std::fs;
use std::path::Path;

#[cfg(unix)]
pub static DOCKER_SOCK: &str = "unix:///run/docker.sock";
#[cfg(not(unix))]
pub static DOCKER_SOCK: &str = "tcp://127.0.0.1:8080";
#[cfg(unix)]
pub static DOCKER_SOCK_SECONDARY: &str = "unix:///var/run/docker.sock";
#[cfg(not(unix))]
pub static DOCKER_SOCK_SECONDARY: &str = DOCKER_SOCK;

/// Maps a daemon fault onto the engine taxonomy.
fn classify(err: docker_api::Error, subject: &str) -> crate::Error {
    if let docker_api::Error::Fault { code, message } = &err {
        if *code == http::StatusCode::NOT_FOUND {
            return EngineError::NotFound(subject.to_string()).into();
        }
        if *code == http::StatusCode::UNAUTHORIZED || *code == http::StatusCode::FORBIDDEN {
            return EngineError::AuthFailed {
                registry: ImageRef::parse(subject).server,
            }
            .into();
        }
        if message.contains("unauthorized") || message.contains("authentication required") {
            return EngineError::AuthRequired {
                registry: ImageRef::parse(subject).server,
            }
            .into();
        }
    }
    err.into()
}

/// Splits streamed chunks into whole lines and forwards them under `prefix`.
/// A trailing partial line is buffered until its newline arrives.
pub(crate) struct LinePump {
    prefix: String,
    buf: String,
}

impl LinePump {
    pub(crate) fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            buf: String::new(),
        }
    }

    pub(crate) fn push(&mut self, bytes: &[u8]) {
        self.buf.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            log_message(&self.prefix, line.trim_end_matches('\n'));
        }
    }

    pub(crate) fn flush(&mut self) {
        if !self.buf.is_empty() {
            log_message(&self.prefix, &self.buf);
            self.buf.clear();
        }
    }
}

/// Docker flavour of the engine runtime.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn inner(&self) -> &Docker {
        &self.docker
    }

    fn container(&self, id: &str) -> docker_api::Container {
        self.docker.containers().get(id)
    }

    async fn drive_build(
        &self,
        opts: &ImageBuildOpts,
        name: &str,
    ) -> Result<String> {
        let images = self.docker.images();
        let mut stream = images.build(opts);
        let mut log_tail = Vec::new();

        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| classify(e, name))? {
                ImageBuildChunk::Error {
                    error,
                    error_detail: _,
                } => {
                    log_tail.push(error);
                    return Err(EngineError::BuildFailed {
                        log_tail: log_tail.join("\n"),
                    }
                    .into());
                }
                ImageBuildChunk::Update { stream } => {
                    let line = stream.trim_end();
                    if !line.is_empty() {
                        log_message(name, line);
                        log_tail.push(line.to_string());
                        if log_tail.len() > 50 {
                            log_tail.remove(0);
                        }
                    }
                }
                ImageBuildChunk::Digest { aux } => {
                    return Ok(aux.id);
                }
                _ => {}
            }
        }

        Err(EngineError::BuildFailed {
            log_tail: format!(
                "stream ended before an image id was received\n{}",
                log_tail.join("\n")
            ),
        }
        .into())
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        let reference = ImageRef::parse(image);
        debug!("pulling image {}", image);

        let mut builder = PullOpts::builder()
            .image(format!("{}/{}", reference.server, reference.name))
            .tag(&reference.tag);
        if let Some(auth) = auth {
            builder = builder.auth(auth.build_docker());
        }

        let images = self.docker.images();
        let mut stream = images.pull(&builder.build());
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| classify(e, image))? {
                ImageBuildChunk::Error { error, .. } => {
                    let lowered = error.to_lowercase();
                    if lowered.contains("unauthorized") || lowered.contains("authentication") {
                        if auth.is_none() {
                            return Err(EngineError::AuthRequired {
                                registry: reference.server,
                            }
                            .into());
                        }
                        return Err(EngineError::AuthFailed {
                            registry: reference.server,
                        }
                        .into());
                    }
                    return err!("pull of `{}` failed - {}", image, error);
                }
                ImageBuildChunk::PullStatus { status, .. } => {
                    trace!("{}", status);
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn list_image(&self, reference: &str) -> Result<Vec<String>> {
        match self.inspect_image(reference).await {
            Ok(info) => Ok(vec![info.id]),
            Err(err) => match EngineError::from_err(&err) {
                Some(EngineError::NotFound(_)) => Ok(vec![]),
                _ => Err(err),
            },
        }
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo> {
        let details = self
            .docker
            .images()
            .get(reference)
            .inspect()
            .await
            .map_err(|e| classify(e, reference))?;

        let platform = match (&details.os, &details.architecture) {
            (Some(os), Some(arch)) => Some(format!("{}/{}", os, arch)),
            _ => None,
        };

        Ok(ImageInfo {
            id: details.id.unwrap_or_default(),
            platform,
            repo_tags: details.repo_tags.unwrap_or_default(),
        })
    }

    async fn tag_image(&self, source: &str, destination: &str) -> Result<()> {
        let dest = ImageRef::parse(destination);
        let repo = if dest.server == crate::runtime::auth::DEFAULT_REGISTRY_HOST {
            dest.name.clone()
        } else {
            format!("{}/{}", dest.server, dest.name)
        };
        self.docker
            .images()
            .get(source)
            .tag(&TagOpts::builder().repo(repo).tag(&dest.tag).build())
            .await
            .map_err(|e| classify(e, source))?;
        Ok(())
    }

    async fn push_image(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        debug!("pushing image {}", reference);
        let mut builder = ImagePushOpts::builder();
        if let Some(auth) = auth {
            builder = builder.auth(auth.build_docker());
        }
        self.docker
            .images()
            .push(reference, &builder.build())
            .await
            .map_err(|e| classify(e, reference))?;
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.docker
            .images()
            .get(reference)
            .remove(&Default::default())
            .await
            .map_err(|e| classify(e, reference))?;
        Ok(())
    }

    async fn build_image(&self, dockerfile: &[u8], name: &str) -> Result<String> {
        debug!("building image {}", name);
        let temp = TempDir::new("engine-build").context("failed to create build context dir")?;
        fs::write(temp.path().join("Dockerfile"), dockerfile)
            .context("failed to write Dockerfile")?;

        let opts = ImageBuildOpts::builder(temp.path()).tag(name).build();
        self.drive_build(&opts, name).await
    }

    async fn build_multi_arch_image(
        &self,
        dockerfile: &[u8],
        source_tar: Option<&[u8]>,
        name: &str,
        platforms: &[PlatformSpec],
        auth: Option<&RegistryAuth>,
    ) -> Result<Vec<String>> {
        let temp = TempDir::new("engine-build").context("failed to create build context dir")?;
        fs::write(temp.path().join("Dockerfile"), dockerfile)
            .context("failed to write Dockerfile")?;
        if let Some(tar_bytes) = source_tar {
            let mut archive = tar::Archive::new(tar_bytes);
            archive
                .unpack(temp.path())
                .context("failed to unpack source context")?;
        }

        // The daemon stores only single-platform images locally, so each
        // platform is built under a platform-suffixed tag and pushed right
        // away; the shared tag is pushed last so the registry ends up with
        // every variant.
        let mut ids = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let tag = format!("{}-{}-{}", name, platform.os, platform.arch);
            let opts = ImageBuildOpts::builder(temp.path()).tag(&tag).build();
            let id = self.drive_build(&opts, &tag).await?;
            self.push_image(&tag, auth).await?;
            ids.push(id);
        }

        Ok(ids)
    }

    async fn create_container(
        &self,
        opts: CreateOpts,
        auth: Option<&RegistryAuth>,
    ) -> Result<String> {
        let image = opts.image_ref().to_string();
        if self.list_image(&image).await?.is_empty() {
            self.pull_image(&image, auth).await?;
        }

        let id = self
            .docker
            .containers()
            .create(&opts.build_docker())
            .await
            .map_err(|e| classify(e, &image))?
            .id()
            .to_string();
        debug!("created container {}", truncate(&id));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.container(id)
            .start()
            .await
            .map_err(|e| classify(e, id))?;
        debug!("started container {}", truncate(id));
        Ok(())
    }

    async fn stop_container(&self, id: &str, signal: Option<&str>) -> Result<()> {
        self.container(id)
            .kill(signal)
            .await
            .map_err(|e| classify(e, id))?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<Option<i64>> {
        let response = self
            .container(id)
            .wait()
            .await
            .map_err(|e| classify(e, id))?;
        if response.error.is_some() {
            return Ok(None);
        }
        Ok(Some(response.status_code as i64))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        let details = self
            .container(id)
            .inspect()
            .await
            .map_err(|e| classify(e, id))?;

        let (running, exit_code) = match &details.state {
            Some(state) => (
                state.running.unwrap_or(false),
                state.exit_code.map(|c| c as i64),
            ),
            None => (false, None),
        };

        Ok(ContainerInfo {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name: details.name,
            image: details.image,
            running,
            exit_code,
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.container(id)
            .remove(&ContainerRemoveOpts::builder().force(true).build())
            .await
            .map_err(|e| classify(e, id))?;
        Ok(())
    }

    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let list = self
            .docker
            .containers()
            .list(&ContainerListOpts::builder().all(all).build())
            .await
            .map_err(|e| classify(e, "containers"))?;

        Ok(list
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c
                    .names
                    .unwrap_or_default()
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .collect(),
            })
            .collect())
    }

    async fn stream_logs(&self, id: &str, prefix: &str, stdout: bool, stderr: bool) -> Result<()> {
        let container = self.container(id);
        let mut stream = container.logs(
            &LogsOpts::builder()
                .stdout(stdout)
                .stderr(stderr)
                .follow(true)
                .build(),
        );

        let mut pump = LinePump::new(prefix);
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| classify(e, id))? {
                TtyChunk::StdOut(bytes) | TtyChunk::StdErr(bytes) => pump.push(&bytes),
                _ => {}
            }
        }
        pump.flush();

        Ok(())
    }

    async fn container_logs(&self, id: &str, stdout: bool, stderr: bool) -> Result<Output<u8>> {
        let container = self.container(id);
        let mut stream =
            container.logs(&LogsOpts::builder().stdout(stdout).stderr(stderr).build());

        let mut output = Output::default();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|e| classify(e, id))? {
                TtyChunk::StdOut(mut bytes) => output.stdout.append(&mut bytes),
                TtyChunk::StdErr(mut bytes) => output.stderr.append(&mut bytes),
                _ => {}
            }
        }

        Ok(output)
    }

    async fn copy_content_to_container(&self, id: &str, content: &[u8], dest: &Path) -> Result<()> {
        self.container(id)
            .copy_file_into(dest, content)
            .await
            .map_err(|e| classify(e, id))
            .context("failed to copy content into container")
    }

    async fn copy_to_container(&self, id: &str, source: &Path, dest: &Path) -> Result<()> {
        let content = fs::read(source)
            .with_context(|| format!("failed to read `{}`", source.display()))?;
        self.copy_content_to_container(id, &content, dest).await
    }

    async fn copy_dir_to_container(&self, id: &str, source: &Path, dest: &Path) -> Result<()> {
        let tarball = crate::archive::tar_directory(source)?;
        let archive_name = format!("dir-{}.tar", uuid::Uuid::new_v4().to_simple());
        let tar_path = Path::new("/tmp").join(&archive_name);

        self.copy_content_to_container(id, &tarball, &tar_path)
            .await?;
        self.exec_container(
            id,
            ExecOpts::default().cmd(&format!(
                "mkdir -p {0} && tar -xf {1} -C {0} && rm -f {1}",
                dest.display(),
                tar_path.display()
            )),
            truncate(id),
        )
        .await
        .map(|_| ())
        .context("failed to extract archive inside container")
    }

    async fn copy_file_from_container(&self, id: &str, source: &Path) -> Result<String> {
        let bytes = self
            .container(id)
            .copy_from(source)
            .try_concat()
            .await
            .map_err(|e| classify(e, id))?;

        crate::archive::first_entry_as_string(&bytes)
    }

    async fn exec_container(
        &self,
        id: &str,
        opts: ExecOpts<'_>,
        prefix: &str,
    ) -> Result<Output<String>> {
        let exec = Exec::create(self.docker.clone(), id, &opts.build_docker())
            .await
            .map_err(|e| classify(e, id))?;
        let mut stream = exec.start();

        let mut container_output = Output::default();
        let mut pump = LinePump::new(prefix);

        while let Some(result) = stream.next().await {
            match result
                .map_err(|e| classify(docker_api::Error::Error(e), id))?
            {
                TtyChunk::StdOut(chunk) => {
                    pump.push(&chunk);
                    container_output
                        .stdout
                        .push(String::from_utf8_lossy(&chunk).to_string());
                }
                TtyChunk::StdErr(chunk) => {
                    pump.push(&chunk);
                    container_output
                        .stderr
                        .push(String::from_utf8_lossy(&chunk).to_string());
                }
                _ => {}
            }
        }
        pump.flush();

        container_output.exit_code = exec
            .inspect()
            .await
            .map(|details| details.exit_code.unwrap_or_default() as u64)
            .map_err(|e| classify(e, id))?;

        Ok(container_output)
    }

    async fn commit_container(&self, id: &str, opts: &CommitOpts) -> Result<String> {
        let reference = ImageRef::parse(&opts.reference);
        let mut builder = docker_api::opts::ContainerCommitOpts::builder()
            .repo(&reference.name)
            .tag(&reference.tag);
        if let Some(comment) = &opts.comment {
            builder = builder.comment(comment);
        }

        self.container(id)
            .commit(&builder.build())
            .await
            .map_err(|e| classify(e, id))
    }

    async fn prune_containers(&self, label_key: &str, label_value: &str) -> Result<()> {
        self.docker
            .containers()
            .prune(
                &ContainerPruneOpts::builder()
                    .filter([ContainerPruneFilter::Label(
                        label_key.to_string(),
                        label_value.to_string(),
                    )])
                    .build(),
            )
            .await
            .map_err(|e| classify(e, "containers"))
            .context("cleaning up containers")?;
        Ok(())
    }
}
