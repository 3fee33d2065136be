pub mod job;
pub mod metrics;
pub mod pool;
pub mod semaphore;

pub use job::{Job, JobOutcome, JobResult, JobType, Payload, Priority};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pool::{PoolConfig, WorkerPool};
pub use semaphore::Semaphore;
