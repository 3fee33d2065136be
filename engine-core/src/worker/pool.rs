use crate::log::{debug, trace, warning};
use crate::runtime::{ExecOpts, Runtime};
use crate::worker::job::{Job, JobOutcome, JobResult, Payload};
use crate::worker::metrics::{MetricsSnapshot, PoolMetrics};
use crate::worker::semaphore::Semaphore;
use crate::{EngineError, Result};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub static DEFAULT_QUEUE_CAPACITY: usize = 100;
pub static DEFAULT_PULL_PERMITS: usize = 3;
pub static DEFAULT_BUILD_PERMITS: usize = 2;
static RESULT_SEND_SAFETY: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub pull_permits: usize,
    pub build_permits: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            pull_permits: DEFAULT_PULL_PERMITS,
            build_permits: DEFAULT_BUILD_PERMITS,
        }
    }
}

fn num_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// Fixed-size worker pool over a bounded FIFO queue.
///
/// Submission blocks only when the queue is full. Results flow out on a
/// buffered channel in completion order; callers correlate by job id.
/// Cancelling the pool context propagates to every in-flight dispatch, not
/// just the queue: a running backend call is abandoned and its job reports
/// `Cancelled`. Stop is idempotent - it closes the queue, cancels the pool
/// context and fails everything still queued with `Cancelled`.
pub struct WorkerPool {
    jobs_tx: Mutex<Option<mpsc::Sender<Job>>>,
    jobs_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    results_tx: Mutex<Option<mpsc::Sender<JobResult>>>,
    results_rx: Mutex<Option<mpsc::Receiver<JobResult>>>,
    cancel: CancellationToken,
    metrics: Arc<PoolMetrics>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    pull_sem: Semaphore,
    build_sem: Semaphore,
}

impl WorkerPool {
    pub fn new(runtime: Arc<dyn Runtime>, config: PoolConfig) -> Self {
        let workers = config.workers.max(1).min(2 * num_workers());
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::channel::<JobResult>(config.queue_capacity.max(1));

        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let cancel = CancellationToken::new();
        let metrics = Arc::new(PoolMetrics::new());
        let pull_sem = Semaphore::new(config.pull_permits.max(1));
        let build_sem = Semaphore::new(config.build_permits.max(1));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                runtime.clone(),
                jobs_rx.clone(),
                results_tx.clone(),
                cancel.clone(),
                metrics.clone(),
                pull_sem.clone(),
                build_sem.clone(),
            )));
        }
        debug!("started worker pool, workers: {}", workers);

        Self {
            jobs_tx: Mutex::new(Some(jobs_tx)),
            jobs_rx,
            results_tx: Mutex::new(Some(results_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            cancel,
            metrics,
            handles: Mutex::new(handles),
            stopped: AtomicBool::new(false),
            pull_sem,
            build_sem,
        }
    }

    /// Enqueues a job, blocking while the queue is full. Returns the job id
    /// used to correlate the result.
    pub async fn submit(&self, job: Job) -> Result<Uuid> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::PoolShutdown.into());
        }
        job.validate()?;

        let sender = match &*self.jobs_tx.lock().await {
            Some(sender) => sender.clone(),
            None => return Err(EngineError::PoolShutdown.into()),
        };

        let id = job.id;
        self.metrics.on_submit();

        let sent = tokio::select! {
            res = sender.send(job) => res.is_ok(),
            _ = self.cancel.cancelled() => false,
        };

        if !sent {
            self.metrics.on_cancelled();
            return Err(EngineError::PoolShutdown.into());
        }
        trace!("submitted job {}", id);
        Ok(id)
    }

    /// Hands out the result channel. May be taken once.
    pub async fn take_results(&self) -> Option<mpsc::Receiver<JobResult>> {
        self.results_rx.lock().await.take()
    }

    /// The pool context. Cancelling it interrupts in-flight jobs and stops
    /// workers from picking up more work.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn pull_semaphore(&self) -> Semaphore {
        self.pull_sem.clone()
    }

    pub fn build_semaphore(&self) -> Semaphore {
        self.build_sem.clone()
    }

    /// Closes the queue, cancels the pool context - interrupting in-flight
    /// dispatches with `Cancelled` - fails the still-queued jobs the same
    /// way and closes the result channel. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping worker pool");

        self.jobs_tx.lock().await.take();
        self.cancel.cancel();

        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                warning!("worker task failed to join - {}", e);
            }
        }

        // everything still queued never ran
        let results_tx = self.results_tx.lock().await.take();
        let mut jobs_rx = self.jobs_rx.lock().await;
        while let Ok(job) = jobs_rx.try_recv() {
            self.metrics.on_cancelled();
            if let Some(tx) = &results_tx {
                let now = Instant::now();
                let record = JobResult {
                    job_id: job.id,
                    job_type: job.job_type,
                    worker_id: usize::MAX,
                    result: Err(EngineError::Cancelled.into()),
                    started: now,
                    finished: now,
                };
                if tx.try_send(record).is_err() {
                    trace!("result consumer gone, dropping cancelled job record");
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    runtime: Arc<dyn Runtime>,
    jobs_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    results_tx: mpsc::Sender<JobResult>,
    cancel: CancellationToken,
    metrics: Arc<PoolMetrics>,
    pull_sem: Semaphore,
    build_sem: Semaphore,
) {
    loop {
        let job = {
            let mut rx = jobs_rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let job = match job {
            Some(job) => job,
            None => break,
        };

        metrics.on_dequeue(job.submitted_at.elapsed());
        let started = Instant::now();
        let timeout = job.effective_timeout();

        // context chain: job token + pool token + type-scoped deadline. A
        // cancellation mid-dispatch abandons the backend call right away.
        let result = tokio::select! {
            res = tokio::time::timeout(
                timeout,
                dispatch(&runtime, &job.payload, &pull_sem, &build_sem),
            ) => match res {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout {
                    op: job.job_type.as_ref().to_string(),
                    after: timeout,
                }
                .into()),
            },
            _ = job.cancel.cancelled() => Err(EngineError::Cancelled.into()),
            _ = cancel.cancelled() => Err(EngineError::Cancelled.into()),
        };

        metrics.on_finish(result.is_ok(), started.elapsed());

        let record = JobResult {
            job_id: job.id,
            job_type: job.job_type,
            worker_id,
            result,
            started,
            finished: Instant::now(),
        };

        // a stuck consumer must not wedge the worker; the send goes first
        // so a deliverable record survives an already-cancelled context
        tokio::select! {
            biased;
            res = tokio::time::timeout(RESULT_SEND_SAFETY, results_tx.send(record)) => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => trace!("result channel closed, dropping record"),
                    Err(_) => warning!("result consumer stalled, dropping record"),
                }
            }
            _ = cancel.cancelled() => {}
        }
    }
    trace!("worker {} exiting", worker_id);
}

async fn dispatch(
    runtime: &Arc<dyn Runtime>,
    payload: &Payload,
    pull_sem: &Semaphore,
    build_sem: &Semaphore,
) -> Result<JobOutcome> {
    match payload {
        Payload::PullImage { image, auth } => {
            let _permit = pull_sem.acquire().await?;
            runtime
                .pull_image(image, auth.as_ref())
                .await
                .map(|_| JobOutcome::Done)
        }
        Payload::CreateContainer { opts, auth } => runtime
            .create_container(opts.clone(), auth.as_ref())
            .await
            .map(JobOutcome::ContainerId),
        Payload::StartContainer { id } => runtime
            .start_container(id)
            .await
            .map(|_| JobOutcome::Done),
        Payload::StopContainer { id, signal } => runtime
            .stop_container(id, signal.as_deref())
            .await
            .map(|_| JobOutcome::Done),
        Payload::BuildImage { dockerfile, name } => {
            let _permit = build_sem.acquire().await?;
            runtime
                .build_image(dockerfile, name)
                .await
                .map(JobOutcome::ImageId)
        }
        Payload::CopyFiles { id, content, dest } => runtime
            .copy_content_to_container(id, content, dest)
            .await
            .map(|_| JobOutcome::Done),
        Payload::ExecCommand { id, cmd, prefix } => runtime
            .exec_container(id, ExecOpts::default().cmd(cmd), prefix)
            .await
            .map(JobOutcome::Exec),
        Payload::InspectImage { reference } => runtime
            .inspect_image(reference)
            .await
            .map(JobOutcome::Image),
        Payload::RemoveContainer { id } => runtime
            .remove_container(id)
            .await
            .map(|_| JobOutcome::Done),
        Payload::WaitContainer { id } => runtime
            .wait_container(id)
            .await
            .map(JobOutcome::ExitStatus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::worker::job::Priority;

    fn test_pool(runtime: Arc<FakeRuntime>, workers: usize) -> WorkerPool {
        WorkerPool::new(
            runtime,
            PoolConfig {
                workers,
                queue_capacity: 16,
                pull_permits: 3,
                build_permits: 2,
            },
        )
    }

    #[tokio::test]
    async fn runs_jobs_and_reports_results() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("alpine:3.19", "linux/amd64");
        let pool = test_pool(runtime, 2);
        let mut results = pool.take_results().await.unwrap();

        let id = pool
            .submit(Job::new(Payload::InspectImage {
                reference: "alpine:3.19".into(),
            }))
            .await
            .unwrap();

        let record = results.recv().await.unwrap();
        assert_eq!(record.job_id, id);
        assert!(record.result.is_ok());
        pool.stop().await;

        let metrics = pool.metrics();
        assert!(metrics.is_balanced());
        assert_eq!(metrics.completed, 1);
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let runtime = Arc::new(FakeRuntime::new());
        let pool = test_pool(runtime, 1);
        pool.stop().await;
        pool.stop().await; // idempotent

        let err = pool
            .submit(Job::new(Payload::StartContainer { id: "x".into() }))
            .await
            .unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::PoolShutdown)
        ));
    }

    #[tokio::test]
    async fn job_timeout_surfaces_in_result() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_wait_delay(Duration::from_secs(60));
        runtime.add_container("c1", "slow", "img");
        let pool = test_pool(runtime, 1);
        let mut results = pool.take_results().await.unwrap();

        pool.submit(
            Job::new(Payload::WaitContainer { id: "c1".into() })
                .timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();

        let record = results.recv().await.unwrap();
        let err = record.result.unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::Timeout { .. })
        ));
        pool.stop().await;
        assert!(pool.metrics().is_balanced());
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_jobs() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_wait_delay(Duration::from_secs(60));
        runtime.add_container("c1", "slow", "img");
        let pool = test_pool(runtime.clone(), 1);
        let mut results = pool.take_results().await.unwrap();

        pool.submit(Job::new(Payload::WaitContainer { id: "c1".into() }))
            .await
            .unwrap();

        // wait until the dispatch reached the backend
        let started = Instant::now();
        while runtime.active_waits() == 0 {
            assert!(
                started.elapsed() < Duration::from_secs(5),
                "dispatch never reached the backend"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.cancel_token().cancel();

        let record = results.recv().await.unwrap();
        let err = record.result.unwrap_err();
        assert!(matches!(
            EngineError::from_err(&err),
            Some(EngineError::Cancelled)
        ));
        // nowhere near the 60s the backend wait would have taken
        assert!(started.elapsed() < Duration::from_secs(5));

        // the backend call itself was dropped, not left running
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.active_waits(), 0);

        pool.stop().await;
        assert!(pool.metrics().is_balanced());
    }

    #[tokio::test]
    async fn job_level_token_interrupts_its_dispatch() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_wait_delay(Duration::from_secs(60));
        runtime.add_container("c1", "slow", "img");
        let pool = test_pool(runtime.clone(), 1);
        let mut results = pool.take_results().await.unwrap();

        let token = CancellationToken::new();
        pool.submit(
            Job::new(Payload::WaitContainer { id: "c1".into() }).cancel_token(token.clone()),
        )
        .await
        .unwrap();

        let started = Instant::now();
        while runtime.active_waits() == 0 {
            assert!(started.elapsed() < Duration::from_secs(5));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();

        let record = results.recv().await.unwrap();
        assert!(matches!(
            EngineError::from_err(&record.result.unwrap_err()),
            Some(EngineError::Cancelled)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runtime.active_waits(), 0);

        pool.stop().await;
    }

    #[tokio::test]
    async fn counters_balance_across_many_jobs() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("img:1", "linux/amd64");
        let pool = Arc::new(test_pool(runtime, 4));
        let mut results = pool.take_results().await.unwrap();

        for _ in 0..20 {
            pool.submit(
                Job::new(Payload::InspectImage {
                    reference: "img:1".into(),
                })
                .priority(Priority::High),
            )
            .await
            .unwrap();
        }
        // a couple of guaranteed failures
        for _ in 0..3 {
            pool.submit(Job::new(Payload::InspectImage {
                reference: "missing:1".into(),
            }))
            .await
            .unwrap();
        }

        let mut seen = 0;
        while seen < 23 {
            let record = results.recv().await.unwrap();
            assert!(pool.metrics().is_balanced());
            seen += 1;
            drop(record);
        }

        pool.stop().await;
        let metrics = pool.metrics();
        assert_eq!(metrics.submitted, 23);
        assert_eq!(metrics.completed, 20);
        assert_eq!(metrics.failed, 3);
        assert!(metrics.is_balanced());
    }
}
