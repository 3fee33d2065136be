use crate::opts::{BuildOpts, Opts};
use engine_core::build::{BuildGroups, Pipeline};
use engine_core::config::{self, AppConfig};
use engine_core::log::{error, info, warning};
use engine_core::plugin::PluginHost;
use engine_core::runtime::{ConnectionPool, Runtime, RuntimeKind};
use engine_core::{ErrContext, Result};

use std::sync::Arc;

pub struct Application {
    runtime: Arc<dyn Runtime>,
}

impl Application {
    pub fn new(config: &AppConfig, opts: &Opts) -> Result<Self> {
        let pool = match (&opts.runtime, &config.container.runtime) {
            (Some(flag), _) => match flag.parse::<RuntimeKind>()? {
                RuntimeKind::Docker => ConnectionPool::docker(
                    engine_core::runtime::docker::DOCKER_SOCK,
                )?,
                RuntimeKind::Podman => ConnectionPool::podman(
                    engine_core::runtime::podman::podman_user_sock(),
                )?,
            },
            (None, Some(RuntimeKind::Docker)) => {
                ConnectionPool::docker(engine_core::runtime::docker::DOCKER_SOCK)?
            }
            (None, Some(RuntimeKind::Podman)) => {
                ConnectionPool::podman(engine_core::runtime::podman::podman_user_sock())?
            }
            (None, None) => ConnectionPool::detected()?,
        };

        Ok(Self {
            runtime: pool.connect(),
        })
    }

    /// Loads the plugin, retrieves the build program and drives the
    /// pipeline. Returns whether every build succeeded.
    pub async fn build(&self, opts: BuildOpts) -> Result<bool> {
        let mut plugin = PluginHost::launch(&opts.plugin, &opts.plugin_args)
            .await
            .context("failed to load build plugin")?;
        info!(
            "plugin loaded, interface version {}",
            plugin.negotiated_version()
        );

        let groups = plugin.get_builds().await.context("retrieving builds")?;
        if let Err(e) = plugin.shutdown().await {
            warning!("plugin shutdown - {}", e);
        }

        if groups.is_empty() {
            warning!("plugin returned no builds");
            return Ok(true);
        }
        info!(
            "running {} builds in {} groups",
            groups.total_builds(),
            groups.len()
        );

        self.run_groups(groups).await
    }

    async fn run_groups(&self, groups: BuildGroups) -> Result<bool> {
        let pipeline = Pipeline::new(self.runtime.clone());

        let cancel = pipeline.cancel_token();
        if let Err(e) = ctrlc::set_handler(move || {
            eprintln!("received interrupt, cancelling builds");
            cancel.cancel();
        }) {
            warning!("failed to install signal handler - {}", e);
        }

        let summaries = pipeline.run(groups).await?;

        let mut all_ok = true;
        for summary in &summaries {
            if summary.ok {
                info!(
                    "{} ({}) finished in {:.1}s",
                    summary.app,
                    summary.image_uri,
                    summary.duration.as_secs_f32()
                );
            } else {
                all_ok = false;
                error!(
                    "{} ({}) failed - {}",
                    summary.app,
                    summary.image_uri,
                    summary.error.as_deref().unwrap_or("unknown")
                );
            }
        }
        Ok(all_ok)
    }
}

/// Prints the merged configuration snapshot.
pub fn show_config() -> Result<()> {
    let snapshot = config::snapshot();
    let rendered = serde_yaml::to_string(&*snapshot).context("rendering configuration")?;
    println!("{}", rendered);
    Ok(())
}
