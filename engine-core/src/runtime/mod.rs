pub mod auth;
pub mod docker;
#[cfg(test)]
pub(crate) mod fake;
pub mod opts;
pub mod podman;

pub use auth::{ImageRef, RegistryAuth, RegistryCredential};
pub use docker::DockerRuntime;
pub use opts::{
    fix_name, CommitOpts, ContainerInfo, ContainerSummary, CreateOpts, ExecOpts, ImageInfo,
    Output, Platform, PlatformSpec,
};
pub use podman::PodmanRuntime;

use crate::log::{debug, trace};
use crate::{EngineError, Result};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;

pub static RUNTIME_ENV_VAR: &str = "CONTAINIFYCI_RUNTIME";

/// The backend daemon flavour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

impl AsRef<str> for RuntimeKind {
    fn as_ref(&self) -> &str {
        match self {
            RuntimeKind::Docker => "docker",
            RuntimeKind::Podman => "podman",
        }
    }
}

impl FromStr for RuntimeKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(RuntimeKind::Docker),
            "podman" => Ok(RuntimeKind::Podman),
            other => Err(EngineError::InvalidSpec(format!("unknown runtime `{}`", other)).into()),
        }
    }
}

lazy_static! {
    static ref DETECTED_KIND: Mutex<Option<RuntimeKind>> = Mutex::new(None);
}

fn socket_exists(uri: &str) -> bool {
    match uri.strip_prefix("unix://") {
        Some(path) => PathBuf::from(path).exists(),
        None => false,
    }
}

/// Picks the backend for this process: explicit `CONTAINIFYCI_RUNTIME`
/// override first, then a reachable Docker socket, then Podman. The result
/// is memoised - all later calls observe the first decision.
pub fn detect() -> Result<RuntimeKind> {
    let mut cached = DETECTED_KIND.lock().unwrap();
    if let Some(kind) = *cached {
        return Ok(kind);
    }

    let kind = if let Ok(value) = std::env::var(RUNTIME_ENV_VAR) {
        let kind = value.parse()?;
        debug!("runtime override from {}: {}", RUNTIME_ENV_VAR, value);
        kind
    } else if socket_exists(docker::DOCKER_SOCK) || socket_exists(docker::DOCKER_SOCK_SECONDARY) {
        RuntimeKind::Docker
    } else if socket_exists(podman::PODMAN_SOCK) || socket_exists(&podman::podman_user_sock()) {
        RuntimeKind::Podman
    } else {
        return Err(EngineError::BackendUnavailable.into());
    };

    trace!("detected container runtime: {}", kind.as_ref());
    *cached = Some(kind);
    Ok(kind)
}

/// The uniform capability surface both backends implement. Callers never
/// branch on the backend flavour.
///
/// All operations honour the caller's cancellation (dropping the future
/// aborts the request) and surface the taxonomy in [`crate::error`]:
/// missing pull credentials yield `AuthRequired`, daemon 404s `NotFound`,
/// exceeded deadlines `Timeout`.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    // image operations
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()>;
    async fn list_image(&self, reference: &str) -> Result<Vec<String>>;
    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo>;
    async fn tag_image(&self, source: &str, destination: &str) -> Result<()>;
    async fn push_image(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<()>;
    async fn remove_image(&self, reference: &str) -> Result<()>;
    /// Builds `name` from the dockerfile, streaming daemon progress into the
    /// log sink, and returns the image id.
    async fn build_image(&self, dockerfile: &[u8], name: &str) -> Result<String>;
    /// Multi-platform build. Both daemons lack local multi-platform image
    /// storage, so the resulting manifest list is pushed inline; returns the
    /// per-platform image ids.
    async fn build_multi_arch_image(
        &self,
        dockerfile: &[u8],
        source_tar: Option<&[u8]>,
        name: &str,
        platforms: &[PlatformSpec],
        auth: Option<&RegistryAuth>,
    ) -> Result<Vec<String>>;

    // container lifecycle
    async fn create_container(
        &self,
        opts: CreateOpts,
        auth: Option<&RegistryAuth>,
    ) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, signal: Option<&str>) -> Result<()>;
    /// Blocks until the container reaches its terminal state. `None` means
    /// the daemon reported no status code - the container was signalled.
    async fn wait_container(&self, id: &str) -> Result<Option<i64>>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo>;
    async fn remove_container(&self, id: &str) -> Result<()>;
    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    // io
    /// Follows the container's output, forwarding each line to the log
    /// aggregator tagged with `prefix`, until EOF.
    async fn stream_logs(&self, id: &str, prefix: &str, stdout: bool, stderr: bool) -> Result<()>;
    /// Collects the container's output without following.
    async fn container_logs(&self, id: &str, stdout: bool, stderr: bool) -> Result<Output<u8>>;
    async fn copy_content_to_container(&self, id: &str, content: &[u8], dest: &Path) -> Result<()>;
    async fn copy_to_container(&self, id: &str, source: &Path, dest: &Path) -> Result<()>;
    async fn copy_dir_to_container(&self, id: &str, source: &Path, dest: &Path) -> Result<()>;
    async fn copy_file_from_container(&self, id: &str, source: &Path) -> Result<String>;
    async fn exec_container(
        &self,
        id: &str,
        opts: ExecOpts<'_>,
        prefix: &str,
    ) -> Result<Output<String>>;
    async fn commit_container(&self, id: &str, opts: &CommitOpts) -> Result<String>;

    /// Prunes containers carrying the given label.
    async fn prune_containers(&self, label_key: &str, label_value: &str) -> Result<()>;
}

#[derive(Clone)]
pub enum RuntimeConnector {
    Docker(docker_api::Docker),
    Podman(podman_api::Podman),
}

pub struct ConnectionPool {
    connector: RuntimeConnector,
}

impl ConnectionPool {
    pub fn docker<S>(uri: S) -> Result<Self>
    where
        S: Into<String>,
    {
        let uri = uri.into();

        Ok(Self {
            connector: RuntimeConnector::Docker(docker_api::Docker::new(&uri)?),
        })
    }

    pub fn podman<S>(uri: S) -> Result<Self>
    where
        S: Into<String>,
    {
        let uri = uri.into();

        Ok(Self {
            connector: RuntimeConnector::Podman(podman_api::Podman::new(&uri)?),
        })
    }

    /// Connects to the detected backend at its default socket.
    pub fn detected() -> Result<Self> {
        match detect()? {
            RuntimeKind::Docker => {
                if socket_exists(docker::DOCKER_SOCK) {
                    Self::docker(docker::DOCKER_SOCK)
                } else {
                    Self::docker(docker::DOCKER_SOCK_SECONDARY)
                }
            }
            RuntimeKind::Podman => {
                let user_sock = podman::podman_user_sock();
                if socket_exists(&user_sock) {
                    Self::podman(user_sock)
                } else {
                    Self::podman(podman::PODMAN_SOCK)
                }
            }
        }
    }

    pub fn connect(&self) -> Arc<dyn Runtime> {
        match &self.connector {
            RuntimeConnector::Docker(docker) => Arc::new(DockerRuntime::new(docker.clone())),
            RuntimeConnector::Podman(podman) => Arc::new(PodmanRuntime::new(podman.clone())),
        }
    }
}
