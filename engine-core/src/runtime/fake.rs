//! In-memory runtime double used by unit tests. Behaviour knobs cover the
//! cases the engine cares about: transient pull failures, slow waits,
//! per-image platforms and call recording.

use crate::runtime::opts::{
    CommitOpts, ContainerInfo, ContainerSummary, CreateOpts, ExecOpts, ImageInfo, Output,
    PlatformSpec,
};
use crate::runtime::{auth::RegistryAuth, Runtime, RuntimeKind};
use crate::{err, EngineError, Error, Result};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Releases its gauge slot on drop, so an operation abandoned mid-dispatch
/// still shows up as finished.
pub(crate) struct GaugeGuard(Arc<AtomicUsize>);

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn enter(current: &Arc<AtomicUsize>, max: &AtomicUsize) -> GaugeGuard {
    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
    max.fetch_max(now, Ordering::SeqCst);
    GaugeGuard(current.clone())
}

#[derive(Clone, Debug)]
pub(crate) struct FakeContainer {
    pub name: String,
    pub image: String,
    pub running: bool,
}

#[derive(Default)]
pub(crate) struct FakeRuntime {
    calls: Mutex<Vec<String>>,
    images: Mutex<HashMap<String, ImageInfo>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    wait_status: Mutex<HashMap<String, Option<i64>>>,
    wait_status_by_name: Mutex<HashMap<String, Option<i64>>>,
    wait_delay_by_name: Mutex<HashMap<String, Duration>>,
    fail_pulls: Mutex<HashMap<String, usize>>,
    pull_delay: Mutex<Duration>,
    wait_delay: Mutex<Duration>,
    build_delay: Mutex<Duration>,
    next_id: AtomicUsize,
    current_pulls: Arc<AtomicUsize>,
    pub max_concurrent_pulls: AtomicUsize,
    current_builds: Arc<AtomicUsize>,
    pub max_concurrent_builds: AtomicUsize,
    current_waits: Arc<AtomicUsize>,
    max_concurrent_waits: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, reference: &str, platform: &str) {
        self.images.lock().unwrap().insert(
            reference.to_string(),
            ImageInfo {
                id: format!("sha256:{}", reference.replace([':', '/'], "-")),
                platform: Some(platform.to_string()),
                repo_tags: vec![reference.to_string()],
            },
        );
    }

    pub fn add_container(&self, id: &str, name: &str, image: &str) {
        self.containers.lock().unwrap().insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                image: image.to_string(),
                running: false,
            },
        );
    }

    pub fn set_wait_status(&self, id: &str, status: Option<i64>) {
        self.wait_status
            .lock()
            .unwrap()
            .insert(id.to_string(), status);
    }

    /// Exit status for any container created under `name`.
    pub fn set_wait_status_by_name(&self, name: &str, status: Option<i64>) {
        self.wait_status_by_name
            .lock()
            .unwrap()
            .insert(name.to_string(), status);
    }

    pub fn set_wait_delay_by_name(&self, name: &str, delay: Duration) {
        self.wait_delay_by_name
            .lock()
            .unwrap()
            .insert(name.to_string(), delay);
    }

    /// The next `times` pulls of `image` fail with a transient error.
    pub fn fail_pull_times(&self, image: &str, times: usize) {
        self.fail_pulls
            .lock()
            .unwrap()
            .insert(image.to_string(), times);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock().unwrap() = delay;
    }

    pub fn set_wait_delay(&self, delay: Duration) {
        *self.wait_delay.lock().unwrap() = delay;
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn fresh_id(&self, kind: &str) -> String {
        format!("{}{}", kind, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Pulls currently executing inside the backend.
    pub fn active_pulls(&self) -> usize {
        self.current_pulls.load(Ordering::SeqCst)
    }

    /// Waits currently executing inside the backend.
    pub fn active_waits(&self) -> usize {
        self.current_waits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    async fn pull_image(&self, image: &str, _auth: Option<&RegistryAuth>) -> Result<()> {
        self.record(format!("pull {}", image));
        let _op = enter(&self.current_pulls, &self.max_concurrent_pulls);

        let delay = *self.pull_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        {
            let mut fails = self.fail_pulls.lock().unwrap();
            if let Some(remaining) = fails.get_mut(image) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return err!("transient registry error for `{}`", image);
                }
            }
        }

        self.add_image(image, &PlatformSpec::host().to_string());
        Ok(())
    }

    async fn list_image(&self, reference: &str) -> Result<Vec<String>> {
        self.record(format!("list {}", reference));
        Ok(self
            .images
            .lock()
            .unwrap()
            .get(reference)
            .map(|i| vec![i.id.clone()])
            .unwrap_or_default())
    }

    async fn inspect_image(&self, reference: &str) -> Result<ImageInfo> {
        self.record(format!("inspect-image {}", reference));
        self.images
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(reference.to_string()).into())
    }

    async fn tag_image(&self, source: &str, destination: &str) -> Result<()> {
        self.record(format!("tag {} {}", source, destination));
        let info = self.images.lock().unwrap().get(source).cloned();
        match info {
            Some(info) => {
                self.images
                    .lock()
                    .unwrap()
                    .insert(destination.to_string(), info);
                Ok(())
            }
            None => Err(EngineError::NotFound(source.to_string()).into()),
        }
    }

    async fn push_image(&self, reference: &str, _auth: Option<&RegistryAuth>) -> Result<()> {
        self.record(format!("push {}", reference));
        Ok(())
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.record(format!("remove-image {}", reference));
        self.images.lock().unwrap().remove(reference);
        Ok(())
    }

    async fn build_image(&self, _dockerfile: &[u8], name: &str) -> Result<String> {
        self.record(format!("build {}", name));
        let _op = enter(&self.current_builds, &self.max_concurrent_builds);

        let delay = *self.build_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.add_image(name, &PlatformSpec::host().to_string());
        Ok(format!("sha256:{}", self.fresh_id("built")))
    }

    async fn build_multi_arch_image(
        &self,
        _dockerfile: &[u8],
        _source_tar: Option<&[u8]>,
        name: &str,
        platforms: &[PlatformSpec],
        _auth: Option<&RegistryAuth>,
    ) -> Result<Vec<String>> {
        self.record(format!("build-multi {} ({})", name, platforms.len()));
        let mut ids = Vec::new();
        for platform in platforms {
            self.add_image(name, &platform.to_string());
            ids.push(format!("sha256:{}", self.fresh_id("built")));
        }
        Ok(ids)
    }

    async fn create_container(
        &self,
        opts: CreateOpts,
        _auth: Option<&RegistryAuth>,
    ) -> Result<String> {
        let id = self.fresh_id("c");
        let name = opts.get_name().unwrap_or(&id).to_string();
        self.record(format!("create {} ({})", name, opts.image_ref()));
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                name,
                image: opts.image_ref().to_string(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start {}", id));
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string()).into()),
        }
    }

    async fn stop_container(&self, id: &str, _signal: Option<&str>) -> Result<()> {
        self.record(format!("stop {}", id));
        match self.containers.lock().unwrap().get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(id.to_string()).into()),
        }
    }

    async fn wait_container(&self, id: &str) -> Result<Option<i64>> {
        self.record(format!("wait {}", id));
        let _op = enter(&self.current_waits, &self.max_concurrent_waits);
        let name = self
            .containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.name.clone());

        let mut delay = *self.wait_delay.lock().unwrap();
        if let Some(name) = &name {
            if let Some(named) = self.wait_delay_by_name.lock().unwrap().get(name) {
                delay = *named;
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let name = match name {
            Some(name) => name,
            None => return Err(EngineError::NotFound(id.to_string()).into()),
        };
        if let Some(status) = self.wait_status_by_name.lock().unwrap().get(&name) {
            return Ok(*status);
        }
        Ok(self
            .wait_status
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(Some(0)))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo> {
        self.record(format!("inspect-container {}", id));
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| ContainerInfo {
                id: id.to_string(),
                name: Some(c.name.clone()),
                image: Some(c.image.clone()),
                running: c.running,
                exit_code: None,
            })
            .ok_or_else(|| EngineError::NotFound(id.to_string()).into())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(format!("remove {}", id));
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn container_list(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        self.record("list-containers".to_string());
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![c.name.clone()],
            })
            .collect())
    }

    async fn stream_logs(
        &self,
        id: &str,
        _prefix: &str,
        _stdout: bool,
        _stderr: bool,
    ) -> Result<()> {
        self.record(format!("logs {}", id));
        Ok(())
    }

    async fn container_logs(&self, id: &str, _stdout: bool, _stderr: bool) -> Result<Output<u8>> {
        self.record(format!("collect-logs {}", id));
        Ok(Output::default())
    }

    async fn copy_content_to_container(
        &self,
        id: &str,
        content: &[u8],
        dest: &Path,
    ) -> Result<()> {
        self.record(format!("copy {} {} ({}B)", id, dest.display(), content.len()));
        Ok(())
    }

    async fn copy_to_container(&self, id: &str, source: &Path, dest: &Path) -> Result<()> {
        self.record(format!(
            "copy-file {} {} -> {}",
            id,
            source.display(),
            dest.display()
        ));
        Ok(())
    }

    async fn copy_dir_to_container(&self, id: &str, source: &Path, dest: &Path) -> Result<()> {
        self.record(format!(
            "copy-dir {} {} -> {}",
            id,
            source.display(),
            dest.display()
        ));
        Ok(())
    }

    async fn copy_file_from_container(&self, id: &str, source: &Path) -> Result<String> {
        self.record(format!("copy-from {} {}", id, source.display()));
        Ok(String::new())
    }

    async fn exec_container(
        &self,
        id: &str,
        _opts: ExecOpts<'_>,
        _prefix: &str,
    ) -> Result<Output<String>> {
        self.record(format!("exec {}", id));
        Ok(Output::default())
    }

    async fn commit_container(&self, id: &str, opts: &CommitOpts) -> Result<String> {
        self.record(format!("commit {} {}", id, opts.reference));
        self.add_image(&opts.reference, &PlatformSpec::host().to_string());
        Ok(format!("sha256:{}", self.fresh_id("committed")))
    }

    async fn prune_containers(&self, label_key: &str, label_value: &str) -> Result<()> {
        self.record(format!("prune {}={}", label_key, label_value));
        Ok(())
    }
}
