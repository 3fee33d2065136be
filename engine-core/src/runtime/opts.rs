use crate::{EngineError, Result};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static DEFAULT_SHELL: &str = "/bin/sh";

/// Length of significant characters of a container ID.
pub(crate) static CONTAINER_ID_LEN: usize = 12;

pub(crate) fn truncate(id: &str) -> &str {
    if id.len() > CONTAINER_ID_LEN {
        &id[..CONTAINER_ID_LEN]
    } else {
        id
    }
}

/// Removes invalid characters from the given name.
///
/// According to the daemon error message allowed characters are [a-zA-Z0-9_.-].
pub fn fix_name(name: &str) -> String {
    name.chars()
        .filter(|&c| c.is_alphanumeric() || c == '-' || c == '.' || c == '_')
        .collect()
}

/// One os/arch pair in daemon notation, e.g. `linux/amd64`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformSpec {
    pub os: String,
    pub arch: String,
    pub variant: Option<String>,
}

impl PlatformSpec {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
            variant: None,
        }
    }

    /// The platform of the machine the engine runs on.
    pub fn host() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(std::env::consts::OS, arch)
    }
}

impl fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.arch, variant),
            None => write!(f, "{}/{}", self.os, self.arch),
        }
    }
}

impl FromStr for PlatformSpec {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut it = s.split('/');
        match (it.next(), it.next(), it.next()) {
            (Some(os), Some(arch), variant) if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: os.to_string(),
                arch: arch.to_string(),
                variant: variant.map(str::to_string),
            }),
            _ => Err(EngineError::InvalidSpec(format!("invalid platform `{}`", s)).into()),
        }
    }
}

/// Host/container platform pair of a build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub host: PlatformSpec,
    pub container: PlatformSpec,
}

impl Platform {
    /// Host-derived pair used when a build requests automatic platform
    /// resolution.
    pub fn auto() -> Self {
        let host = PlatformSpec::host();
        Self {
            container: host.clone(),
            host,
        }
    }
}

#[derive(Debug, Default)]
pub struct Output<T> {
    pub stdout: Vec<T>,
    pub stderr: Vec<T>,
    pub exit_code: u64,
}

impl Output<String> {
    pub fn as_result(self) -> Result<Vec<String>> {
        if self.exit_code != 0 {
            Err(anyhow!(self.stderr.join("\n")))
        } else {
            Ok(self.stdout)
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct CreateOpts {
    image: String,
    name: Option<String>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    labels: Option<Vec<(String, String)>>,
    volumes: Option<Vec<String>>,
    env: Option<Vec<(String, String)>>,
    working_dir: Option<String>,
    user: Option<String>,
    platform: Option<PlatformSpec>,
}

impl CreateOpts {
    pub fn new(image: impl Into<String>) -> Self {
        CreateOpts {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn image_ref(&self) -> &str {
        &self.image
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn cmd(mut self, command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.cmd = Some(command.into_iter().map(|c| c.into()).collect());
        self
    }

    pub fn entrypoint(mut self, entrypoint: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.entrypoint = Some(entrypoint.into_iter().map(|e| e.into()).collect());
        self
    }

    pub fn labels(
        mut self,
        labels: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.labels = Some(
            labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    pub fn volumes(mut self, volumes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.volumes = Some(volumes.into_iter().map(|v| v.into()).collect());
        self
    }

    pub fn env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = Some(
            env.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn env_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn platform(mut self, platform: PlatformSpec) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn get_platform(&self) -> Option<&PlatformSpec> {
        self.platform.as_ref()
    }

    fn env_kv_vec(&self) -> Vec<String> {
        self.env
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    pub fn build_docker(self) -> docker_api::opts::ContainerCreateOpts {
        let env = self.env_kv_vec();
        let mut builder = docker_api::opts::ContainerCreateOpts::builder().image(self.image);

        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(cmd) = self.cmd {
            builder = builder.command(cmd);
        }
        if let Some(entrypoint) = self.entrypoint {
            builder = builder.entrypoint(entrypoint);
        }
        if let Some(labels) = self.labels {
            builder = builder.labels(labels);
        }
        if let Some(volumes) = self.volumes {
            builder = builder.volumes(volumes);
        }
        if !env.is_empty() {
            builder = builder.env(env);
        }
        if let Some(working_dir) = self.working_dir {
            builder = builder.working_dir(working_dir);
        }
        if let Some(user) = self.user {
            builder = builder.user(user);
        }

        builder.build()
    }

    pub fn build_podman(self) -> podman_api::opts::ContainerCreateOpts {
        let mut builder = podman_api::opts::ContainerCreateOpts::builder();

        builder = builder.image(self.image);

        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(cmd) = self.cmd {
            builder = builder.command(cmd);
        }
        if let Some(entrypoint) = self.entrypoint {
            builder = builder.entrypoint(entrypoint);
        }
        if let Some(labels) = self.labels {
            builder = builder.labels(labels);
        }
        if let Some(env) = self.env {
            builder = builder.env(env);
        }
        if let Some(working_dir) = self.working_dir {
            builder = builder.work_dir(working_dir);
            builder = builder.create_working_dir(true);
        }
        if let Some(user) = self.user {
            builder = builder.user(user);
        }

        builder.build()
    }
}

#[derive(Clone, Debug)]
pub struct ExecOpts<'opts> {
    cmd: &'opts str,
    allocate_tty: bool,
    attach_stdout: bool,
    attach_stderr: bool,
    privileged: bool,
    shell: &'opts str,
    user: Option<&'opts str>,
    working_dir: Option<&'opts str>,
    env: Option<Vec<(String, String)>>,
}

impl<'opts> Default for ExecOpts<'opts> {
    fn default() -> Self {
        Self {
            cmd: "",
            allocate_tty: false,
            attach_stderr: true,
            attach_stdout: true,
            privileged: false,
            shell: DEFAULT_SHELL,
            user: None,
            working_dir: None,
            env: None,
        }
    }
}

impl<'opts> ExecOpts<'opts> {
    pub fn new() -> Self {
        Self {
            ..Default::default()
        }
    }

    pub fn cmd(mut self, command: &'opts str) -> Self {
        self.cmd = command;
        self
    }

    pub fn tty(mut self, allocate: bool) -> Self {
        self.allocate_tty = allocate;
        self
    }

    pub fn attach_stdout(mut self, attach: bool) -> Self {
        self.attach_stdout = attach;
        self
    }

    pub fn attach_stderr(mut self, attach: bool) -> Self {
        self.attach_stderr = attach;
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn user(mut self, user: &'opts str) -> Self {
        self.user = Some(user);
        self
    }

    pub fn shell(mut self, shell: &'opts str) -> Self {
        self.shell = shell;
        self
    }

    pub fn working_dir(mut self, working_dir: &'opts str) -> Self {
        self.working_dir = Some(working_dir);
        self
    }

    pub fn env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = Some(
            env.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn build_docker(self) -> docker_api::opts::ExecCreateOpts {
        let mut builder = docker_api::opts::ExecCreateOpts::builder();

        builder = builder
            .command(vec![self.shell, "-c", self.cmd])
            .tty(self.allocate_tty)
            .attach_stdout(self.attach_stdout)
            .attach_stderr(self.attach_stderr)
            .privileged(self.privileged);

        if let Some(user) = self.user {
            builder = builder.user(user);
        }

        if let Some(working_dir) = self.working_dir {
            builder = builder.working_dir(working_dir);
        }

        if let Some(env) = self.env {
            builder = builder.env(
                env.into_iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>(),
            );
        }

        builder.build()
    }

    pub fn build_podman(self) -> podman_api::opts::ExecCreateOpts {
        use podman_api::opts::UserOpt;
        let mut builder = podman_api::opts::ExecCreateOpts::builder();

        builder = builder
            .command(vec![self.shell, "-c", self.cmd])
            .tty(self.allocate_tty)
            .attach_stdout(self.attach_stdout)
            .attach_stderr(self.attach_stderr)
            .privileged(self.privileged);

        if let Some(user) = self.user {
            builder = builder.user(UserOpt::User(user.into()));
        }

        if let Some(working_dir) = self.working_dir {
            builder = builder.working_dir(working_dir);
        }

        if let Some(env) = self.env {
            builder = builder.env(env);
        }

        builder.build()
    }
}

/// Options for committing a container into an image.
#[derive(Clone, Debug, Default)]
pub struct CommitOpts {
    pub reference: String,
    pub comment: Option<String>,
    pub changes: Vec<String>,
}

/// Subset of image metadata the engine inspects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub platform: Option<String>,
    pub repo_tags: Vec<String>,
}

impl ImageInfo {
    /// True if the inspected platform matches `requested`.
    pub fn matches_platform(&self, requested: &PlatformSpec) -> bool {
        match &self.platform {
            Some(platform) => platform == &requested.to_string(),
            None => false,
        }
    }
}

/// Subset of container metadata the engine inspects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: Option<String>,
    pub image: Option<String>,
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// One entry of a container listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_platform_specs() {
        let p: PlatformSpec = "linux/amd64".parse().unwrap();
        assert_eq!(p, PlatformSpec::new("linux", "amd64"));
        assert_eq!(p.to_string(), "linux/amd64");

        let v: PlatformSpec = "linux/arm/v7".parse().unwrap();
        assert_eq!(v.variant.as_deref(), Some("v7"));
        assert_eq!(v.to_string(), "linux/arm/v7");

        assert!("linux".parse::<PlatformSpec>().is_err());
        assert!("/amd64".parse::<PlatformSpec>().is_err());
    }

    #[test]
    fn sanitizes_container_names() {
        assert_eq!(fix_name("my app:1.0"), "myapp1.0");
        assert_eq!(fix_name("ok_name-2"), "ok_name-2");
    }

    #[test]
    fn truncates_long_ids() {
        assert_eq!(truncate("0123456789abcdef"), "0123456789ab");
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn image_info_platform_match() {
        let info = ImageInfo {
            id: "sha256:abc".into(),
            platform: Some("linux/amd64".into()),
            repo_tags: vec![],
        };
        assert!(info.matches_platform(&PlatformSpec::new("linux", "amd64")));
        assert!(!info.matches_platform(&PlatformSpec::new("linux", "arm64")));
    }
}
