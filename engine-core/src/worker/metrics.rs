use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free pool counters. `submitted = completed + failed + running +
/// queued` holds at every observation point.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
    running: AtomicU64,
    peak_queued: AtomicU64,
    queue_time_us: AtomicU64,
    exec_time_us: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_submit(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let depth = self.queued.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_queued.fetch_max(depth, Ordering::SeqCst);
    }

    pub fn on_dequeue(&self, queue_time: Duration) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.running.fetch_add(1, Ordering::SeqCst);
        self.queue_time_us
            .fetch_add(queue_time.as_micros() as u64, Ordering::SeqCst);
    }

    pub fn on_finish(&self, success: bool, exec_time: Duration) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        if success {
            self.completed.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.exec_time_us
            .fetch_add(exec_time.as_micros() as u64, Ordering::SeqCst);
    }

    /// Accounts a job that was dropped from the queue without running.
    pub fn on_cancelled(&self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let finished = completed + failed;
        let queue_time_us = self.queue_time_us.load(Ordering::SeqCst);
        let exec_time_us = self.exec_time_us.load(Ordering::SeqCst);

        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed,
            failed,
            queued: self.queued.load(Ordering::SeqCst),
            running: self.running.load(Ordering::SeqCst),
            peak_queued: self.peak_queued.load(Ordering::SeqCst),
            avg_queue_time: average(queue_time_us, finished),
            avg_exec_time: average(exec_time_us, finished),
        }
    }
}

fn average(total_us: u64, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_micros(total_us / count)
    }
}

/// Point-in-time view of the counters with derived averages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub queued: u64,
    pub running: u64,
    pub peak_queued: u64,
    pub avg_queue_time: Duration,
    pub avg_exec_time: Duration,
}

impl MetricsSnapshot {
    /// The conservation invariant over the counters.
    pub fn is_balanced(&self) -> bool {
        self.submitted == self.completed + self.failed + self.running + self.queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_stay_balanced() {
        let metrics = PoolMetrics::new();
        for _ in 0..5 {
            metrics.on_submit();
        }
        assert!(metrics.snapshot().is_balanced());
        assert_eq!(metrics.snapshot().peak_queued, 5);

        for i in 0..5 {
            metrics.on_dequeue(Duration::from_millis(10));
            assert!(metrics.snapshot().is_balanced());
            metrics.on_finish(i % 2 == 0, Duration::from_millis(20));
            assert!(metrics.snapshot().is_balanced());
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.queued, 0);
        assert_eq!(snapshot.running, 0);
    }

    #[test]
    fn averages_derive_from_totals() {
        let metrics = PoolMetrics::new();
        metrics.on_submit();
        metrics.on_dequeue(Duration::from_millis(4));
        metrics.on_finish(true, Duration::from_millis(8));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.avg_queue_time, Duration::from_millis(4));
        assert_eq!(snapshot.avg_exec_time, Duration::from_millis(8));
    }
}
