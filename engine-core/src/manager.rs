//! Batched parallel container operations layered on the worker pool.
//!
//! Every batch fans out one request per item, submits typed jobs to the
//! pool and hands back a bounded channel of results in completion order;
//! each result carries the identifier of its request. The channel closes
//! once every request finished, so callers drain it to completion.
//! Cancelling the manager's token makes in-flight requests yield a
//! `Cancelled` result instead of leaving the channel open.

use crate::log::{debug, trace, warning};
use crate::runtime::{CreateOpts, ImageInfo, RegistryAuth, Runtime};
use crate::worker::{Job, JobOutcome, JobResult, Payload, Semaphore, WorkerPool};
use crate::{err, EngineError, Error, Result};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

pub static DEFAULT_MAX_RETRIES: usize = 3;
pub static DEFAULT_INSPECT_PERMITS: usize = 8;
static BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// One image pull request.
#[derive(Clone, Debug)]
pub struct PullRequest {
    pub image: String,
    pub auth: Option<RegistryAuth>,
}

/// One container create request; `id` is the caller's correlation key.
#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub id: String,
    pub opts: CreateOpts,
    pub auth: Option<RegistryAuth>,
}

/// Completion record of one batched request.
#[derive(Debug)]
pub struct OpResult<T> {
    pub id: String,
    pub result: Result<T>,
}

/// Retries `pull` with linear backoff `(attempt + 1) * unit`, clamped by the
/// cancellation token. Yields the last error once attempts are exhausted.
pub async fn pull_with_retry(
    runtime: &Arc<dyn Runtime>,
    image: &str,
    auth: Option<&RegistryAuth>,
    max_retries: usize,
    backoff_unit: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }
        match runtime.pull_image(image, auth).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                trace!("pull attempt {} for {} failed - {}", attempt + 1, image, err);
                last_err = Some(err);
            }
        }
        if attempt < max_retries {
            let backoff = backoff_unit * (attempt as u32 + 1);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::Cancelled.into()))
}

/// Push retry; same grammar as pull.
pub async fn push_with_retry(
    runtime: &Arc<dyn Runtime>,
    reference: &str,
    auth: Option<&RegistryAuth>,
    max_retries: usize,
    backoff_unit: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..=max_retries {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }
        match runtime.push_image(reference, auth).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                trace!(
                    "push attempt {} for {} failed - {}",
                    attempt + 1,
                    reference,
                    err
                );
                last_err = Some(err);
            }
        }
        if attempt < max_retries {
            let backoff = backoff_unit * (attempt as u32 + 1);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled.into()),
            }
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::Cancelled.into()))
}

/// Routes the pool's completion records to the batch task that submitted
/// each job.
#[derive(Default)]
struct ResultRouter {
    waiters: Mutex<HashMap<uuid::Uuid, oneshot::Sender<JobResult>>>,
}

impl ResultRouter {
    async fn register(&self, id: uuid::Uuid) -> oneshot::Receiver<JobResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        rx
    }

    async fn deliver(&self, record: JobResult) {
        if let Some(tx) = self.waiters.lock().await.remove(&record.job_id) {
            let _ = tx.send(record);
        } else {
            trace!("no waiter for job {}", record.job_id);
        }
    }

    async fn forget(&self, id: uuid::Uuid) {
        self.waiters.lock().await.remove(&id);
    }
}

pub struct ConcurrentManager {
    pool: Arc<WorkerPool>,
    router: Arc<ResultRouter>,
    inspect_sem: Semaphore,
    max_retries: usize,
    backoff_unit: Duration,
    cancel: CancellationToken,
}

impl ConcurrentManager {
    /// Builds the manager over an existing pool and takes over the pool's
    /// result channel.
    pub async fn new(pool: Arc<WorkerPool>, cancel: CancellationToken) -> Result<Self> {
        let mut results = pool
            .take_results()
            .await
            .ok_or_else(|| anyhow!("pool result channel already taken"))?;

        let router = Arc::new(ResultRouter::default());
        let router_task = router.clone();
        tokio::spawn(async move {
            while let Some(record) = results.recv().await {
                router_task.deliver(record).await;
            }
        });

        // cancelling the manager must reach jobs already dispatching, so
        // the token is forwarded into the pool context
        {
            let parent = cancel.clone();
            let pool_cancel = pool.cancel_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = parent.cancelled() => pool_cancel.cancel(),
                    _ = pool_cancel.cancelled() => {}
                }
            });
        }

        Ok(Self {
            pool,
            router,
            inspect_sem: Semaphore::new(DEFAULT_INSPECT_PERMITS),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_unit: BACKOFF_UNIT,
            cancel,
        })
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn inspect_permits(mut self, permits: usize) -> Self {
        self.inspect_sem = Semaphore::new(permits.max(1));
        self
    }

    #[cfg(test)]
    pub(crate) fn backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Submits one job and awaits its routed result.
    async fn run_job(&self, payload: Payload) -> Result<JobOutcome> {
        let job = Job::new(payload);
        let rx = self.router.register(job.id).await;
        let id = job.id;

        if let Err(err) = self.pool.submit(job).await {
            self.router.forget(id).await;
            return Err(err);
        }

        let record = tokio::select! {
            record = rx => record.map_err(|_| EngineError::PoolShutdown)?,
            _ = self.cancel.cancelled() => {
                self.router.forget(id).await;
                return Err(EngineError::Cancelled.into());
            }
        };
        record.result
    }

    /// Pulls a batch of images; the pool's pull semaphore bounds the
    /// concurrency, transient failures retry with linear backoff.
    pub fn pull_images_parallel(
        self: &Arc<Self>,
        requests: Vec<PullRequest>,
    ) -> mpsc::Receiver<OpResult<()>> {
        let (tx, rx) = mpsc::channel(requests.len().max(1));
        debug!("pulling {} images in parallel", requests.len());

        for request in requests {
            let mgr = self.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let mut last_err = None;
                for attempt in 0..=mgr.max_retries {
                    if mgr.cancel.is_cancelled() {
                        last_err = Some(EngineError::Cancelled.into());
                        break;
                    }
                    match mgr
                        .run_job(Payload::PullImage {
                            image: request.image.clone(),
                            auth: request.auth.clone(),
                        })
                        .await
                    {
                        Ok(_) => {
                            last_err = None;
                            break;
                        }
                        Err(err) => {
                            trace!(
                                "pull attempt {} for {} failed - {}",
                                attempt + 1,
                                request.image,
                                err
                            );
                            last_err = Some(err);
                        }
                    }
                    if attempt < mgr.max_retries {
                        let backoff = mgr.backoff_unit * (attempt as u32 + 1);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = mgr.cancel.cancelled() => {
                                last_err = Some(EngineError::Cancelled.into());
                                break;
                            }
                        }
                    }
                }

                let result = match last_err {
                    None => Ok(()),
                    Some(err) => Err(err),
                };
                let _ = tx
                    .send(OpResult {
                        id: request.image,
                        result,
                    })
                    .await;
            });
        }

        rx
    }

    /// Creates a batch of containers; cheap enough to run ungated.
    pub fn create_containers_parallel(
        self: &Arc<Self>,
        requests: Vec<CreateRequest>,
    ) -> mpsc::Receiver<OpResult<String>> {
        let (tx, rx) = mpsc::channel(requests.len().max(1));

        for request in requests {
            let mgr = self.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = mgr
                    .run_job(Payload::CreateContainer {
                        opts: request.opts,
                        auth: request.auth,
                    })
                    .await
                    .and_then(|outcome| match outcome {
                        JobOutcome::ContainerId(id) => Ok(id),
                        other => unexpected(other),
                    });
                let _ = tx
                    .send(OpResult {
                        id: request.id,
                        result,
                    })
                    .await;
            });
        }

        rx
    }

    pub fn start_containers_parallel(
        self: &Arc<Self>,
        ids: Vec<String>,
    ) -> mpsc::Receiver<OpResult<()>> {
        self.unit_batch(ids, |id| Payload::StartContainer { id })
    }

    pub fn stop_containers_parallel(
        self: &Arc<Self>,
        ids: Vec<String>,
    ) -> mpsc::Receiver<OpResult<()>> {
        self.unit_batch(ids, |id| Payload::StopContainer { id, signal: None })
    }

    pub fn remove_containers_parallel(
        self: &Arc<Self>,
        ids: Vec<String>,
    ) -> mpsc::Receiver<OpResult<()>> {
        self.unit_batch(ids, |id| Payload::RemoveContainer { id })
    }

    fn unit_batch(
        self: &Arc<Self>,
        ids: Vec<String>,
        payload: impl Fn(String) -> Payload + Send + 'static + Copy,
    ) -> mpsc::Receiver<OpResult<()>> {
        let (tx, rx) = mpsc::channel(ids.len().max(1));

        for id in ids {
            let mgr = self.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = mgr.run_job(payload(id.clone())).await.map(|_| ());
                let _ = tx.send(OpResult { id, result }).await;
            });
        }

        rx
    }

    pub fn wait_containers_parallel(
        self: &Arc<Self>,
        ids: Vec<String>,
    ) -> mpsc::Receiver<OpResult<Option<i64>>> {
        let (tx, rx) = mpsc::channel(ids.len().max(1));

        for id in ids {
            let mgr = self.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = mgr
                    .run_job(Payload::WaitContainer { id: id.clone() })
                    .await
                    .and_then(|outcome| match outcome {
                        JobOutcome::ExitStatus(status) => Ok(status),
                        other => unexpected(other),
                    });
                let _ = tx.send(OpResult { id, result }).await;
            });
        }

        rx
    }

    /// Inspects a batch of images, additionally gated by the manager's
    /// inspect semaphore.
    pub fn inspect_images_parallel(
        self: &Arc<Self>,
        references: Vec<String>,
    ) -> mpsc::Receiver<OpResult<ImageInfo>> {
        let (tx, rx) = mpsc::channel(references.len().max(1));

        for reference in references {
            let mgr = self.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = async {
                    let _permit = mgr.inspect_sem.acquire().await?;
                    mgr.run_job(Payload::InspectImage {
                        reference: reference.clone(),
                    })
                    .await
                    .and_then(|outcome| match outcome {
                        JobOutcome::Image(info) => Ok(info),
                        other => unexpected(other),
                    })
                }
                .await;
                let _ = tx
                    .send(OpResult {
                        id: reference,
                        result,
                    })
                    .await;
            });
        }

        rx
    }

    /// Existence checks; a `NotFound` maps to `Ok(false)` rather than an
    /// error.
    pub fn check_images_exist_parallel(
        self: &Arc<Self>,
        references: Vec<String>,
    ) -> mpsc::Receiver<OpResult<bool>> {
        let (tx, rx) = mpsc::channel(references.len().max(1));

        for reference in references {
            let mgr = self.clone();
            let tx = tx.clone();

            tokio::spawn(async move {
                let result = async {
                    let _permit = mgr.inspect_sem.acquire().await?;
                    match mgr
                        .run_job(Payload::InspectImage {
                            reference: reference.clone(),
                        })
                        .await
                    {
                        Ok(_) => Ok(true),
                        Err(err) => match EngineError::from_err(&err) {
                            Some(EngineError::NotFound(_)) => Ok(false),
                            _ => Err(err),
                        },
                    }
                }
                .await;
                let _ = tx
                    .send(OpResult {
                        id: reference,
                        result,
                    })
                    .await;
            });
        }

        rx
    }

    /// Shuts the underlying pool down; outstanding batch results surface as
    /// cancellations.
    pub async fn shutdown(&self) {
        self.pool.stop().await;
        if !self.router.waiters.lock().await.is_empty() {
            warning!("manager shut down with outstanding batch requests");
        }
    }
}

fn unexpected<T>(outcome: JobOutcome) -> Result<T> {
    err!("unexpected job outcome {:?}", outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::worker::PoolConfig;
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    async fn manager(runtime: Arc<FakeRuntime>, pull_permits: usize) -> Arc<ConcurrentManager> {
        let pool = Arc::new(WorkerPool::new(
            runtime,
            PoolConfig {
                workers: 8,
                queue_capacity: 32,
                pull_permits,
                build_permits: 2,
            },
        ));
        Arc::new(
            ConcurrentManager::new(pool, CancellationToken::new())
                .await
                .unwrap()
                .backoff_unit(Duration::from_millis(20)),
        )
    }

    #[tokio::test]
    async fn pull_batch_respects_pool_semaphore() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_pull_delay(Duration::from_millis(40));
        let mgr = manager(runtime.clone(), 2).await;

        let requests = (0..6)
            .map(|i| PullRequest {
                image: format!("img{}:latest", i),
                auth: None,
            })
            .collect();

        let started = Instant::now();
        let mut rx = mgr.pull_images_parallel(requests);
        let mut done = 0;
        while let Some(result) = rx.recv().await {
            assert!(result.result.is_ok(), "{}: {:?}", result.id, result.result);
            done += 1;
        }
        assert_eq!(done, 6);

        // 6 pulls at concurrency 2 and 40ms each need at least 3 rounds
        assert!(started.elapsed() >= Duration::from_millis(110));
        assert!(runtime.max_concurrent_pulls.load(Ordering::SeqCst) <= 2);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn pull_retries_with_backoff_then_succeeds() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_pull_times("flaky:1", 2);
        let mgr = manager(runtime.clone(), 3).await;

        let started = Instant::now();
        let mut rx = mgr.pull_images_parallel(vec![PullRequest {
            image: "flaky:1".into(),
            auth: None,
        }]);

        let result = rx.recv().await.unwrap();
        assert!(result.result.is_ok());
        assert_eq!(runtime.call_count("pull flaky:1"), 3);
        // backoff after attempts one and two: 20ms + 40ms
        assert!(started.elapsed() >= Duration::from_millis(55));
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn pull_exhausts_retries_and_yields_last_error() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.fail_pull_times("gone:1", 10);
        let pool = Arc::new(WorkerPool::new(
            runtime.clone(),
            PoolConfig {
                workers: 2,
                queue_capacity: 8,
                pull_permits: 1,
                build_permits: 1,
            },
        ));
        let mgr = Arc::new(
            ConcurrentManager::new(pool, CancellationToken::new())
                .await
                .unwrap()
                .backoff_unit(Duration::from_millis(10))
                .max_retries(2),
        );

        let mut rx = mgr.pull_images_parallel(vec![PullRequest {
            image: "gone:1".into(),
            auth: None,
        }]);

        let result = rx.recv().await.unwrap();
        assert!(result.result.is_err());
        assert_eq!(runtime.call_count("pull gone:1"), 3);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_yields_error_results() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_pull_delay(Duration::from_millis(300));
        let pool = Arc::new(WorkerPool::new(
            runtime,
            PoolConfig {
                workers: 2,
                queue_capacity: 8,
                pull_permits: 1,
                build_permits: 1,
            },
        ));
        let cancel = CancellationToken::new();
        let mgr = Arc::new(
            ConcurrentManager::new(pool, cancel.clone())
                .await
                .unwrap()
                .backoff_unit(Duration::from_millis(10)),
        );

        let mut rx = mgr.pull_images_parallel(vec![
            PullRequest {
                image: "a:1".into(),
                auth: None,
            },
            PullRequest {
                image: "b:1".into(),
                auth: None,
            },
        ]);

        cancel.cancel();
        let mut cancelled = 0;
        while let Some(result) = rx.recv().await {
            if result.result.is_err() {
                cancelled += 1;
            }
        }
        assert!(cancelled >= 1);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_backend_calls() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_pull_delay(Duration::from_secs(60));
        let pool = Arc::new(WorkerPool::new(
            runtime.clone(),
            PoolConfig {
                workers: 2,
                queue_capacity: 8,
                pull_permits: 2,
                build_permits: 1,
            },
        ));
        let cancel = CancellationToken::new();
        let mgr = Arc::new(
            ConcurrentManager::new(pool, cancel.clone())
                .await
                .unwrap()
                .backoff_unit(Duration::from_millis(10)),
        );

        let mut rx = mgr.pull_images_parallel(vec![PullRequest {
            image: "a:1".into(),
            auth: None,
        }]);

        let started = Instant::now();
        while runtime.active_pulls() == 0 {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "pull never reached the backend"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();

        let result = rx.recv().await.unwrap();
        assert!(result.result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));

        // the worker abandoned the backend pull, not just the caller's wait
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.active_pulls(), 0);

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn wait_batch_correlates_results_by_id() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_container("c1", "one", "img");
        runtime.add_container("c2", "two", "img");
        runtime.set_wait_status("c2", Some(3));
        let mgr = manager(runtime, 2).await;

        let mut rx = mgr.wait_containers_parallel(vec!["c1".into(), "c2".into()]);
        let mut statuses = std::collections::HashMap::new();
        while let Some(result) = rx.recv().await {
            statuses.insert(result.id.clone(), result.result.unwrap());
        }
        assert_eq!(statuses["c1"], Some(0));
        assert_eq!(statuses["c2"], Some(3));
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn existence_checks_do_not_error_on_missing() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("present:1", "linux/amd64");
        let mgr = manager(runtime, 2).await;

        let mut rx =
            mgr.check_images_exist_parallel(vec!["present:1".into(), "absent:1".into()]);
        let mut seen = std::collections::HashMap::new();
        while let Some(result) = rx.recv().await {
            seen.insert(result.id.clone(), result.result.unwrap());
        }
        assert_eq!(seen["present:1"], true);
        assert_eq!(seen["absent:1"], false);
        mgr.shutdown().await;
    }
}
