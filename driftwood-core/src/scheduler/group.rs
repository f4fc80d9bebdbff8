//! Per-group dispatcher task.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

use super::{Job, JobFn, JobSpec, RunRecord, SchedulerError};

pub(super) enum GroupCommand {
    Submit(Job),
    Cancel { name: String },
    Shutdown,
}

/// Client side of one job group.
pub(super) struct GroupHandle {
    tx: mpsc::UnboundedSender<GroupCommand>,
    active: Arc<AtomicUsize>,
    max_queued: usize,
    records: Arc<Mutex<Vec<RunRecord>>>,
}

impl GroupHandle {
    pub(super) fn submit(&self, key: &str, job: Job) -> Result<(), SchedulerError> {
        // Reserve a queue slot before handing the job to the dispatcher.
        loop {
            let current = self.active.load(Ordering::Acquire);
            if current >= self.max_queued {
                return Err(SchedulerError::QueueFull {
                    key: key.to_string(),
                    limit: self.max_queued,
                });
            }
            if self
                .active
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        if self.tx.send(GroupCommand::Submit(job)).is_err() {
            self.active.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedulerError::UnknownGroup {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    pub(super) fn send(&self, command: GroupCommand) {
        let _ = self.tx.send(command);
    }

    pub(super) fn records(&self) -> Vec<RunRecord> {
        self.records.lock().clone()
    }
}

pub(super) fn spawn_group(key: String, max_concurrent: usize, max_queued: usize) -> GroupHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (fire_tx, fire_rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicUsize::new(0));
    let records = Arc::new(Mutex::new(Vec::new()));

    spawn_launcher(key.clone(), max_concurrent, Arc::clone(&records), fire_rx);

    let dispatcher = Dispatcher {
        key,
        jobs: HashMap::new(),
        heap: BinaryHeap::new(),
        fire_tx,
        active: Arc::clone(&active),
        seq: 0,
    };
    tokio::spawn(dispatcher.run(rx));

    GroupHandle {
        tx,
        active,
        max_queued,
        records,
    }
}

/// One firing, handed from the dispatcher to the launch queue.
struct Firing {
    name: String,
    run: JobFn,
    keep_record: bool,
    run_index: u64,
}

/// Launches firings strictly in the order the dispatcher emitted them.
///
/// Permits are acquired sequentially here rather than inside the spawned
/// tasks, so the due/priority order holds on any runtime flavor even when
/// the group is saturated.
fn spawn_launcher(
    group: String,
    max_concurrent: usize,
    records: Arc<Mutex<Vec<RunRecord>>>,
    mut rx: mpsc::UnboundedReceiver<Firing>,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    tokio::spawn(async move {
        while let Some(firing) = rx.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let group = group.clone();
            let records = Arc::clone(&records);
            tokio::spawn(async move {
                let _permit = permit;
                let result = std::panic::AssertUnwindSafe((firing.run)()).catch_unwind().await;
                let panicked = result.is_err();
                if panicked {
                    tracing::error!(
                        group = %group,
                        job = %firing.name,
                        run_index = firing.run_index,
                        "job firing panicked"
                    );
                }
                if firing.keep_record {
                    records.lock().push(RunRecord {
                        job_name: firing.name,
                        run_index: firing.run_index,
                        panicked,
                    });
                }
            });
        }
    });
}

/// Heap entry; "greater" fires first: earlier due time, then higher
/// priority, then submission order.
struct DueEntry {
    due: Instant,
    priority: i32,
    seq: u64,
    name: String,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct ScheduledJob {
    spec: JobSpec,
    run: JobFn,
    runs_started: u64,
}

struct Dispatcher {
    key: String,
    jobs: HashMap<String, ScheduledJob>,
    heap: BinaryHeap<DueEntry>,
    fire_tx: mpsc::UnboundedSender<Firing>,
    active: Arc<AtomicUsize>,
    seq: u64,
}

impl Dispatcher {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<GroupCommand>) {
        loop {
            let next_due = self.heap.peek().map(|entry| entry.due);
            tokio::select! {
                command = rx.recv() => match command {
                    Some(GroupCommand::Submit(job)) => self.schedule(job),
                    Some(GroupCommand::Cancel { name }) => self.cancel(&name),
                    Some(GroupCommand::Shutdown) | None => break,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() => {
                    self.fire_due();
                }
            }
        }
        tracing::debug!(group = %self.key, "job group dispatcher stopped");
    }

    fn schedule(&mut self, job: Job) {
        let due = Instant::now() + job.spec.initial_delay;
        self.seq += 1;
        self.heap.push(DueEntry {
            due,
            priority: job.spec.priority,
            seq: self.seq,
            name: job.spec.name.clone(),
        });
        self.jobs.insert(
            job.spec.name.clone(),
            ScheduledJob {
                spec: job.spec,
                run: job.run,
                runs_started: 0,
            },
        );
    }

    fn cancel(&mut self, name: &str) {
        if self.jobs.remove(name).is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(group = %self.key, job = name, "job cancelled");
        }
    }

    /// Fires everything due, ties resolved by the heap order.
    fn fire_due(&mut self) {
        let now = Instant::now();
        while let Some(entry) = self.heap.peek() {
            if entry.due > now {
                break;
            }
            let entry = self.heap.pop().unwrap_or_else(|| unreachable!("peeked"));
            let Some(job) = self.jobs.get_mut(&entry.name) else {
                // Cancelled; the heap entry is stale.
                continue;
            };

            job.runs_started += 1;
            let run_index = job.runs_started;
            let run = Arc::clone(&job.run);
            let keep_record = job.spec.keep_record;
            let repeat_interval = job.spec.repeat_interval;
            let total_runs = job.spec.total_runs;
            let _ = self.fire_tx.send(Firing {
                name: entry.name.clone(),
                run,
                keep_record,
                run_index,
            });

            let retired =
                repeat_interval.is_none() || (total_runs != 0 && run_index >= total_runs);
            if retired {
                self.jobs.remove(&entry.name);
                self.active.fetch_sub(1, Ordering::AcqRel);
            } else if let Some(interval) = repeat_interval {
                self.seq += 1;
                self.heap.push(DueEntry {
                    due: entry.due + interval,
                    priority: entry.priority,
                    seq: self.seq,
                    name: entry.name,
                });
            }
        }
    }

}
