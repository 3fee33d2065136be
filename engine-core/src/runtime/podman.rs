use crate::log::{debug, log_message, trace};
use crate::runtime::auth::{ImageRef, RegistryAuth};
use crate::runtime::docker::LinePump;
use crate::runtime::opts::{
    truncate, CommitOpts, ContainerInfo, ContainerSummary, CreateOpts, ExecOpts, ImageInfo,
    Output, PlatformSpec,
};
use crate::runtime::{Runtime, RuntimeKind};
use crate::{err, EngineError, ErrContext, Error, Result};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use podman_api::{
    conn::TtyChunk,
    opts::{
        ContainerListOpts, ContainerLogsOpts, ContainerPruneFilter, ContainerPruneOpts,
        ImageBuildOpts, ImagePushOpts, PullOpts,
    },
    Podman,
};
use tempdir::TempDir;

use std::fs;
use std::path::Path;

#[cfg(unix)]
pub static PODMAN_SOCK: &str = "unix:///run/podman/podman.sock";
#[cfg(not(unix))]
pub static PODMAN_SOCK: &str = "tcp://127.0.0.1:8080";

/// The rootless per-user socket location.
pub fn podman_user_sock() -> String {
    let uid = std::env::var("UID").unwrap_or_else(|_| "1000".to_string());
    format!("unix:///run/user/{}/podman/podman.sock", uid)
}

fn classify(err: podman_api::Error, subject: &str) -> crate::Error {
    if let podman_api::Error::Fault { code, message } = &err {
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

/// Podman flavour of the engine runtime.
pub struct PodmanRuntime {
    podman: Podman,
}

impl PodmanRuntime {
    pub fn new(podman: Podman) -> Self {
        Self { podman }
    }

    pub fn inner(&self) -> &Podman {
        &self.podman
    }

    fn container(&self, id: &str) -> podman_api::api::Container {
        self.podman.containers().get(id)
    }

    async fn drive_build(&self, opts: &ImageBuildOpts, name: &str) -> Result<String> {
        let images = self.podman.images();
        let mut stream = images.build(opts).map_err(|e| classify(e, name))?;
        let mut log_tail = Vec::new();
        let mut image_id = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(e, name))?;
            let line = chunk.stream.trim_end().to_string();
            if !line.is_empty() {
                log_message(name, &line);
                log_tail.push(line.clone());
                if log_tail.len() > 50 {
                    log_tail.remove(0);
                }
                // the final stream line carries the image id
                image_id = Some(line);
            }
        }

        image_id.ok_or_else(|| {
            EngineError::BuildFailed {
                log_tail: log_tail.join("\n"),
            }
            .into()
        })
    }
}

#[async_trait]
impl Runtime for PodmanRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Podman
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        let reference = ImageRef::parse(image);
        debug!("pulling image {}", image);

        let mut builder = PullOpts::builder().reference(image);
        if let Some(auth) = auth {
            builder.auth(auth.build_podman());
        }

        let images = self.podman.images();
        let mut stream = images.pull(&builder.build());
        while let Some(report) = stream.next().await {
            let report = report.map_err(|e| classify(e, image))?;
            if let Some(error) = report.error {
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
            if let Some(stream) = report.stream {
                trace!("{}", stream.trim_end());
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
            .podman
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
        self.podman
            .images()
            .get(source)
            .tag(
                &podman_api::opts::ImageTagOpts::builder()
                    .repo(repo)
                    .tag(&dest.tag)
                    .build(),
            )
            .await
            .map_err(|e| classify(e, source))?;
        Ok(())
    }

    async fn push_image(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        debug!("pushing image {}", reference);
        let mut builder = ImagePushOpts::builder();
        if let Some(auth) = auth {
            builder = builder.auth(auth.build_podman());
        }
        self.podman
            .images()
            .get(reference)
            .push(&builder.build())
            .await
            .map_err(|e| classify(e, reference))?;
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.podman
            .images()
            .get(reference)
            .remove()
            .await
            .map_err(|e| classify(e, reference))?;
        Ok(())
    }

    async fn build_image(&self, dockerfile: &[u8], name: &str) -> Result<String> {
        debug!("building image {}", name);
        let temp = TempDir::new("engine-build").context("failed to create build context dir")?;
        fs::write(temp.path().join("Dockerfile"), dockerfile)
            .context("failed to write Dockerfile")?;

        let opts = ImageBuildOpts::builder(temp.path().to_string_lossy()).tag(name).build();
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

        let mut ids = Vec::with_capacity(platforms.len());
        for platform in platforms {
            let tag = format!("{}-{}-{}", name, platform.os, platform.arch);
            let opts = ImageBuildOpts::builder(temp.path().to_string_lossy())
                .tag(&tag)
                .build();
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
            .podman
            .containers()
            .create(&opts.build_podman())
            .await
            .map_err(|e| classify(e, &image))?
            .id;
        debug!("created container {}", truncate(&id));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.container(id)
            .start(None)
            .await
            .map_err(|e| classify(e, id))?;
        debug!("started container {}", truncate(id));
        Ok(())
    }

    async fn stop_container(&self, id: &str, signal: Option<&str>) -> Result<()> {
        match signal {
            Some(signal) => self
                .container(id)
                .send_signal(signal)
                .await
                .map_err(|e| classify(e, id))?,
            None => self
                .container(id)
                .kill()
                .await
                .map_err(|e| classify(e, id))?,
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<Option<i64>> {
        self.container(id)
            .wait(&Default::default())
            .await
            .map_err(|e| classify(e, id))?;

        let details = self.inspect_container(id).await?;
        Ok(details.exit_code)
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
            image: details.image_name,
            running,
            exit_code,
        })
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.container(id)
            .remove()
            .await
            .map_err(|e| classify(e, id))?;
        Ok(())
    }

    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let list = self
            .podman
            .containers()
            .list(&ContainerListOpts::builder().all(all).build())
            .await
            .map_err(|e| classify(e, "containers"))?;

        Ok(list
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
            })
            .collect())
    }

    async fn stream_logs(&self, id: &str, prefix: &str, stdout: bool, stderr: bool) -> Result<()> {
        let container = self.container(id);
        let mut stream = container.logs(
            &ContainerLogsOpts::builder()
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
        let mut stream = container.logs(
            &ContainerLogsOpts::builder()
                .stdout(stdout)
                .stderr(stderr)
                .build(),
        );

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
        let exec = self
            .container(id)
            .create_exec(&opts.build_podman())
            .await
            .map_err(|e| classify(e, id))?;

        let start_opts = Default::default();
        let stream = exec.start(&start_opts).await.map_err(|e| classify(e, id))?;

        let mut container_output = Output::default();
        let mut pump = LinePump::new(prefix);

        if let Some(mut stream) = stream {
            while let Some(result) = stream.next().await {
                match result.map_err(|e| classify(e, id))? {
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
        }
        pump.flush();

        container_output.exit_code = exec
            .inspect()
            .await
            .map(|details| {
                details
                    .get("ExitCode")
                    .and_then(|code| code.as_u64())
                    .unwrap_or_default()
            })
            .map_err(|e| classify(e, id))?;

        Ok(container_output)
    }

    async fn commit_container(&self, id: &str, opts: &CommitOpts) -> Result<String> {
        let reference = ImageRef::parse(&opts.reference);
        let mut builder = podman_api::opts::ContainerCommitOpts::builder()
            .repo(&reference.name)
            .tag(&reference.tag);
        if let Some(comment) = &opts.comment {
            builder = builder.comment(comment);
        }

        self.container(id)
            .commit(&builder.build())
            .await
            .map_err(|e| classify(e, id))?;

        let details = self
            .podman
            .images()
            .get(&opts.reference)
            .inspect()
            .await
            .map_err(|e| classify(e, &opts.reference))?;

        Ok(details.id.unwrap_or_default())
    }

    async fn prune_containers(&self, label_key: &str, label_value: &str) -> Result<()> {
        self.podman
            .containers()
            .prune(
                &ContainerPruneOpts::builder()
                    .filter([ContainerPruneFilter::LabelKeyVal(
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
