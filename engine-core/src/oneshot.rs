use crate::build::spec::Build;
use crate::container::Container;
use crate::runtime::{CreateOpts, Output, Runtime};
use crate::Result;

use std::sync::Arc;
use uuid::Uuid;

/// Simple job that spawns a container with a command to execute and returns
/// its stdout and/or stderr.
pub struct OneShotCtx {
    id: String,
    opts: CreateOpts,
    stdout: bool,
    stderr: bool,
}

impl OneShotCtx {
    pub fn new(opts: CreateOpts, stdout: bool, stderr: bool) -> Self {
        let id = format!("engine-oneshot-{}", Uuid::new_v4().to_simple());

        Self {
            id,
            opts,
            stdout,
            stderr,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

pub async fn run(
    runtime: Arc<dyn Runtime>,
    build: Arc<Build>,
    ctx: OneShotCtx,
) -> Result<Output<u8>> {
    let opts = ctx.opts.clone().name(ctx.id.clone());
    let mut container = Container::new(runtime.clone(), build, opts);
    let id = container.create().await?.to_string();

    container.start().await?;
    container.wait().await?;

    let output = runtime.container_logs(&id, ctx.stdout, ctx.stderr).await?;
    container.remove().await?;
    if let Some(pump) = container.take_log_pump() {
        let _ = pump.await;
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::spec::BuildType;
    use crate::runtime::fake::FakeRuntime;

    #[tokio::test]
    async fn runs_and_reaps_the_container() {
        let fake = Arc::new(FakeRuntime::new());
        fake.add_image("runner:1", "linux/amd64");
        let runtime: Arc<dyn Runtime> = fake.clone();
        let mut build = Build::new("svc", BuildType::AI, "svc");
        build.defaults();

        let ctx = OneShotCtx::new(CreateOpts::new("runner:1"), true, true);
        run(runtime, Arc::new(build), ctx).await.unwrap();

        assert_eq!(fake.call_count("create"), 1);
        assert_eq!(fake.call_count("start"), 1);
        assert_eq!(fake.call_count("wait"), 1);
        assert_eq!(fake.call_count("remove"), 1);
    }
}
