//! Content-addressed intermediate images.
//!
//! Helper images (toolchains, linters, scanners) are identified by a
//! fingerprint over everything that determines their content: the dockerfile
//! bytes, the base-image pins and the requested platform set. The tag
//! `registry/name:fingerprint` is treated as exists / pull / build-then-push.

use crate::checksum::{compute_checksum, sum_checksum};
use crate::log::{debug, info, trace};
use crate::manager::{push_with_retry, DEFAULT_MAX_RETRIES};
use crate::runtime::{PlatformSpec, RegistryAuth, Runtime, RuntimeKind};
use crate::{err, Error, Result};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

lazy_static! {
    // at most one build per fingerprint runs at a time, process-wide
    static ref FINGERPRINT_LOCKS: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>> =
        Mutex::new(HashMap::new());
}

fn lock_for(fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = FINGERPRINT_LOCKS.lock().unwrap();
    locks
        .entry(fingerprint.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone()
}

/// Base-image pins referenced by a dockerfile, in order of appearance.
pub fn base_images(dockerfile: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(dockerfile)
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let rest = line.strip_prefix("FROM ").or_else(|| line.strip_prefix("from "))?;
            // strip a build-stage alias
            let image = rest.split_whitespace().next()?;
            Some(image.to_string())
        })
        .collect()
}

/// The identity of an intermediate image; opaque to callers.
pub fn fingerprint(dockerfile: &[u8], platforms: &[PlatformSpec]) -> String {
    let mut sums = vec![compute_checksum(dockerfile)];
    for base in base_images(dockerfile) {
        sums.push(compute_checksum(base.as_bytes()));
    }
    for platform in platforms {
        sums.push(compute_checksum(platform.to_string().as_bytes()));
    }
    sum_checksum(sums)
}

/// One intermediate image requirement of a build step.
#[derive(Clone, Debug)]
pub struct IntermediateImage {
    /// Full tag `registry/name:fingerprint`.
    pub tag: String,
    pub fingerprint: String,
    pub dockerfile: Vec<u8>,
    pub platforms: Vec<PlatformSpec>,
    pub source_tar: Option<Vec<u8>>,
    pub auth: Option<RegistryAuth>,
}

impl IntermediateImage {
    pub fn new(
        registry: &str,
        name: &str,
        dockerfile: Vec<u8>,
        platforms: Vec<PlatformSpec>,
    ) -> Self {
        let fingerprint = fingerprint(&dockerfile, &platforms);
        Self {
            tag: format!("{}/{}:{}", registry, name, fingerprint),
            fingerprint,
            dockerfile,
            platforms,
            source_tar: None,
            auth: None,
        }
    }

    pub fn source_tar(mut self, tar: Vec<u8>) -> Self {
        self.source_tar = Some(tar);
        self
    }

    pub fn auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.auth = auth;
        self
    }
}

/// True iff a local image under `tag` matches every requested platform. A
/// single-platform image never satisfies a multi-platform requirement.
pub async fn image_exists(
    runtime: &Arc<dyn Runtime>,
    tag: &str,
    platforms: &[PlatformSpec],
) -> Result<bool> {
    for platform in platforms {
        match runtime.inspect_image(tag).await {
            Ok(info) => {
                if !info.matches_platform(platform) {
                    trace!(
                        "image {} platform {:?} does not satisfy {}",
                        tag,
                        info.platform,
                        platform
                    );
                    return Ok(false);
                }
            }
            Err(err) => match crate::EngineError::from_err(&err) {
                Some(crate::EngineError::NotFound(_)) => return Ok(false),
                _ => return Err(err),
            },
        }
    }
    Ok(!platforms.is_empty())
}

/// Pulls `tag` and verifies the local copy matches `platform`. A mismatch
/// after the pull is an error the caller turns into a build.
pub async fn pull_by_platform(
    runtime: &Arc<dyn Runtime>,
    tag: &str,
    platform: &PlatformSpec,
    auth: Option<&RegistryAuth>,
) -> Result<()> {
    runtime.pull_image(tag, auth).await?;
    let info = runtime.inspect_image(tag).await?;
    if !info.matches_platform(platform) {
        return err!(
            "pulled image `{}` is {:?}, requested {}",
            tag,
            info.platform,
            platform
        );
    }
    Ok(())
}

/// The cache protocol: exists, else pull, else build and push. Guarded by a
/// process-wide keyed mutex so identical fingerprints never build twice at
/// the same time.
pub async fn ensure(
    runtime: &Arc<dyn Runtime>,
    image: &IntermediateImage,
    cancel: &CancellationToken,
) -> Result<()> {
    let lock = lock_for(&image.fingerprint);
    let _guard = lock.lock().await;

    if image_exists(runtime, &image.tag, &image.platforms).await? {
        debug!("intermediate image {} already present", image.tag);
        return Ok(());
    }

    let mut pulled = true;
    for platform in &image.platforms {
        if let Err(err) = pull_by_platform(runtime, &image.tag, platform, image.auth.as_ref()).await
        {
            trace!("pull of {} failed - {}", image.tag, err);
            pulled = false;
            break;
        }
    }
    if pulled && !image.platforms.is_empty() {
        info!("intermediate image {} pulled", image.tag);
        return Ok(());
    }

    if image.platforms.len() <= 1 {
        runtime.build_image(&image.dockerfile, &image.tag).await?;
        push_with_retry(
            runtime,
            &image.tag,
            image.auth.as_ref(),
            DEFAULT_MAX_RETRIES,
            Duration::from_secs(1),
            cancel,
        )
        .await?;
        // Docker keeps the pushed copy in its own store, Podman needs the
        // local one for later create calls
        if runtime.kind() == RuntimeKind::Docker {
            runtime.remove_image(&image.tag).await?;
        }
    } else {
        runtime
            .build_multi_arch_image(
                &image.dockerfile,
                image.source_tar.as_deref(),
                &image.tag,
                &image.platforms,
                image.auth.as_ref(),
            )
            .await?;
    }

    info!("intermediate image {} built and pushed", image.tag);
    Ok(())
}
