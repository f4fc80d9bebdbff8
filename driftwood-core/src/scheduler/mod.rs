//! Timer and priority task runner.
//!
//! Jobs are organized into named groups; each group is an independent
//! scheduling domain with its own dispatcher task, concurrency bound, and
//! queue bound. Jobs carry an initial delay, an optional repeat interval, a
//! priority used as a tie-break when several jobs come due at the same
//! instant, and a run-count limit. A firing that panics is caught and
//! logged; it never cancels the schedule or the dispatcher.

mod group;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use self::group::{GroupCommand, GroupHandle};

/// Errors returned by scheduler registration and submission.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Job group {key} already registered")]
    DuplicateGroup { key: String },

    #[error("Job group {key} not registered")]
    UnknownGroup { key: String },

    #[error("Job group {key} queue is full ({limit} jobs)")]
    QueueFull { key: String, limit: usize },
}

/// Boxed job body, invoked once per firing.
pub type JobFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Static description of one scheduled job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Unique name within the group; cancellation key.
    pub name: String,
    /// Delay before the first firing.
    pub initial_delay: Duration,
    /// Interval between firings; `None` means one-shot.
    pub repeat_interval: Option<Duration>,
    /// Higher fires first when due simultaneously.
    pub priority: i32,
    /// Total firings before the schedule retires; 0 means unbounded.
    pub total_runs: u64,
    /// Whether to retain a completion record per firing.
    pub keep_record: bool,
}

impl JobSpec {
    /// A periodic job with default priority that runs forever.
    pub fn periodic(name: impl Into<String>, initial_delay: Duration, interval: Duration) -> Self {
        Self {
            name: name.into(),
            initial_delay,
            repeat_interval: Some(interval),
            priority: 0,
            total_runs: 0,
            keep_record: false,
        }
    }

    /// A one-shot job fired once after `delay`.
    pub fn one_shot(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            initial_delay: delay,
            repeat_interval: None,
            priority: 0,
            total_runs: 1,
            keep_record: false,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_total_runs(mut self, total_runs: u64) -> Self {
        self.total_runs = total_runs;
        self
    }

    pub fn with_record(mut self) -> Self {
        self.keep_record = true;
        self
    }
}

/// A job ready for submission: spec plus body.
pub struct Job {
    pub(crate) spec: JobSpec,
    pub(crate) run: JobFn,
}

impl Job {
    pub fn new<F, Fut>(spec: JobSpec, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            spec,
            run: Arc::new(move || Box::pin(f())),
        }
    }
}

/// Record of one completed firing, kept when the job asked for it.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub job_name: String,
    pub run_index: u64,
    pub panicked: bool,
}

/// Handle to the scheduler; cheap to clone.
#[derive(Clone, Default)]
pub struct Scheduler {
    groups: Arc<Mutex<HashMap<String, GroupHandle>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job group and spawns its dispatcher.
    ///
    /// # Errors
    /// - `SchedulerError::DuplicateGroup` - key already registered
    pub fn register_job_group(
        &self,
        key: &str,
        max_concurrent: usize,
        max_queued: usize,
    ) -> Result<(), SchedulerError> {
        let mut groups = self.groups.lock();
        if groups.contains_key(key) {
            return Err(SchedulerError::DuplicateGroup {
                key: key.to_string(),
            });
        }
        let handle = group::spawn_group(key.to_string(), max_concurrent, max_queued);
        groups.insert(key.to_string(), handle);
        tracing::debug!(group = key, max_concurrent, max_queued, "job group registered");
        Ok(())
    }

    /// Submits a job to a group.
    ///
    /// # Errors
    /// - `SchedulerError::UnknownGroup` - group was never registered
    /// - `SchedulerError::QueueFull` - group already holds `max_queued` jobs
    pub fn submit(&self, key: &str, job: Job) -> Result<(), SchedulerError> {
        let groups = self.groups.lock();
        let handle = groups.get(key).ok_or_else(|| SchedulerError::UnknownGroup {
            key: key.to_string(),
        })?;
        handle.submit(key, job)
    }

    /// Cancels future executions of a job; in-flight firings finish.
    ///
    /// Idempotent: cancelling an unknown or already-cancelled job is a no-op.
    ///
    /// # Errors
    /// - `SchedulerError::UnknownGroup` - group was never registered
    pub fn cancel(&self, key: &str, job_name: &str) -> Result<(), SchedulerError> {
        let groups = self.groups.lock();
        let handle = groups.get(key).ok_or_else(|| SchedulerError::UnknownGroup {
            key: key.to_string(),
        })?;
        handle.send(GroupCommand::Cancel {
            name: job_name.to_string(),
        });
        Ok(())
    }

    /// Completion records retained for a group, oldest first.
    pub fn completed_records(&self, key: &str) -> Vec<RunRecord> {
        self.groups
            .lock()
            .get(key)
            .map(|handle| handle.records())
            .unwrap_or_default()
    }

    /// Stops every dispatcher. Queued jobs are dropped; in-flight firings
    /// finish on their own.
    pub fn shutdown(&self) {
        for handle in self.groups.lock().values() {
            handle.send(GroupCommand::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_job(spec: JobSpec, counter: Arc<AtomicU32>) -> Job {
        Job::new(spec, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_duplicate_group_rejected() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("sweep", 1, 4).unwrap();

        let result = scheduler.register_job_group("sweep", 1, 4);
        assert!(matches!(result, Err(SchedulerError::DuplicateGroup { .. })));
    }

    #[tokio::test]
    async fn test_submit_to_unknown_group() {
        let scheduler = Scheduler::new();
        let job = counting_job(
            JobSpec::one_shot("j", Duration::ZERO),
            Arc::new(AtomicU32::new(0)),
        );

        let result = scheduler.submit("missing", job);
        assert!(matches!(result, Err(SchedulerError::UnknownGroup { .. })));
    }

    #[tokio::test]
    async fn test_queue_bound_enforced() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("g", 1, 2).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        // Far-future jobs stay queued and count against the bound.
        for i in 0..2 {
            let spec = JobSpec::one_shot(format!("j{i}"), Duration::from_secs(3600));
            scheduler
                .submit("g", counting_job(spec, Arc::clone(&counter)))
                .unwrap();
        }

        let spec = JobSpec::one_shot("j2", Duration::from_secs(3600));
        let result = scheduler.submit("g", counting_job(spec, Arc::clone(&counter)));
        assert!(matches!(
            result,
            Err(SchedulerError::QueueFull { limit: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_job_fires_on_interval() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("g", 4, 16).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let spec = JobSpec::periodic("tick", Duration::from_millis(100), Duration::from_millis(100));
        scheduler
            .submit("g", counting_job(spec, Arc::clone(&counter)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_runs_retires_schedule() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("g", 4, 16).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let spec = JobSpec::periodic("tick", Duration::from_millis(10), Duration::from_millis(10))
            .with_total_runs(2);
        scheduler
            .submit("g", counting_job(spec, Arc::clone(&counter)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_breaks_simultaneous_ties() {
        let scheduler = Scheduler::new();
        // One slot forces strictly ordered firing.
        scheduler.register_job_group("g", 1, 16).unwrap();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            let order = Arc::clone(&order);
            let spec = JobSpec::one_shot(name, Duration::from_millis(100)).with_priority(priority);
            scheduler
                .submit(
                    "g",
                    Job::new(spec, move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(name);
                        }
                    }),
                )
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_priority_order_holds_on_multi_thread_runtime() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("g", 1, 16).unwrap();
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 9), ("mid", 5)] {
            let order = Arc::clone(&order);
            let spec = JobSpec::one_shot(name, Duration::from_millis(50)).with_priority(priority);
            scheduler
                .submit(
                    "g",
                    Job::new(spec, move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(name);
                        }
                    }),
                )
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_future_runs() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("g", 4, 16).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let spec = JobSpec::periodic("tick", Duration::from_millis(10), Duration::from_millis(10));
        scheduler
            .submit("g", counting_job(spec, Arc::clone(&counter)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        scheduler.cancel("g", "tick").unwrap();
        scheduler.cancel("g", "tick").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_never_kills_the_schedule() {
        let scheduler = Scheduler::new();
        scheduler.register_job_group("g", 4, 16).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let spec = JobSpec::periodic("flaky", Duration::from_millis(10), Duration::from_millis(10))
            .with_total_runs(3)
            .with_record();
        let probe = Arc::clone(&counter);
        scheduler
            .submit(
                "g",
                Job::new(spec, move || {
                    let count = probe.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if count == 0 {
                            panic!("first firing fails");
                        }
                    }
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let records = scheduler.completed_records("g");
        assert_eq!(records.len(), 3);
        assert!(records[0].panicked);
        assert!(!records[1].panicked);
    }
}
