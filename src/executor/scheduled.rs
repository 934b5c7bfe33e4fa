//! Pool for delayed, periodic and long running tasks.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{trace, warn};

use super::handle::{with_interrupt, Job, PeriodicState};
use super::{panic_message, run_job};

/// A queued task, ordered by how soon it is due.
pub(crate) struct Entry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

pub(crate) enum Task {
    Once(Box<dyn Job>),
    Periodic(Periodic),
}

pub(crate) struct Periodic {
    pub(crate) state: Arc<PeriodicState>,
    pub(crate) schedule: Repeat,
    pub(crate) task: Box<dyn FnMut() + Send>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Repeat {
    /// Next run is due `period` after the previous deadline.
    FixedRate(Duration),
    /// Next run is due `period` after the previous run finished.
    FixedDelay(Duration),
}

impl Entry {
    pub(crate) fn new(deadline: Instant, seq: u64, task: Task) -> Self {
        Self {
            deadline,
            seq,
            task,
        }
    }

    /// Time left until the entry is due, zero if overdue.
    pub(crate) fn delay(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }
}

// Comparing absolute deadlines orders entries exactly like comparing their
// remaining delays at any single instant, without reading the clock.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

struct Shared {
    queue: Mutex<BinaryHeap<Reverse<Entry>>>,
    available: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    fn push(&self, entry: Entry) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if self.shutdown.load(Ordering::SeqCst) {
            // Dropping finishes one-off handles with a shutdown error.
            abandon(entry);
            return;
        }
        queue.push(Reverse(entry));
        self.available.notify_one();
    }
}

/// Fixed set of threads serving a deadline ordered queue.
pub(crate) struct ScheduledPool {
    shared: Arc<Shared>,
    seq: AtomicU64,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ScheduledPool {
    pub(crate) fn new(threads: usize, name: &str) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("{name}-scheduled-{i}"))
                    .spawn(move || worker(shared))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        Ok(Self {
            shared,
            seq: AtomicU64::new(0),
            threads: Mutex::new(handles),
        })
    }

    /// Next sequence number, breaking ties between equal deadlines in
    /// submission order.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns a closure that inserts `entry` into the queue, for callers
    /// that funnel insertions through another executor.
    pub(crate) fn inserter(&self, entry: Entry) -> impl FnOnce() + Send + 'static {
        let shared = self.shared.clone();
        move || shared.push(entry)
    }

    pub(crate) fn insert(&self, entry: Entry) {
        self.shared.push(entry);
    }

    pub(crate) fn queued(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the workers and abandons every queued task.
    pub(crate) fn shutdown(&self) {
        let drained: Vec<_> = {
            let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            self.shared.shutdown.store(true, Ordering::SeqCst);
            self.shared.available.notify_all();
            queue.drain().collect()
        };

        for Reverse(entry) in drained {
            abandon(entry);
        }

        let handles = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in handles {
            // A task shutting down its own pool can't join itself.
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn abandon(entry: Entry) {
    if let Task::Periodic(periodic) = &entry.task {
        periodic.state.done.store(true, Ordering::SeqCst);
    }
}

fn worker(shared: Arc<Shared>) {
    let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            trace!(context = "scheduling_pool", "Scheduled worker stopped");
            return;
        }

        let now = Instant::now();
        let wait = match queue.peek() {
            None => None,
            Some(Reverse(entry)) => Some(entry.delay(now)),
        };

        match wait {
            None => {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(delay) if !delay.is_zero() => {
                queue = shared
                    .available
                    .wait_timeout(queue, delay)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let Some(Reverse(entry)) = queue.pop() else {
                    continue;
                };
                drop(queue);

                if let Some(next) = run(entry) {
                    shared.push(next);
                }

                queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
}

/// Runs a due entry, returning the follow-up entry of a periodic task.
fn run(entry: Entry) -> Option<Entry> {
    let Entry {
        deadline,
        seq,
        task,
    } = entry;

    match task {
        Task::Once(job) => {
            run_job(job);
            None
        }
        Task::Periodic(mut periodic) => {
            if periodic.state.done.load(Ordering::SeqCst) {
                return None;
            }

            let interrupt = periodic.state.interrupt.clone();
            let outcome = with_interrupt(&interrupt, || {
                panic::catch_unwind(AssertUnwindSafe(&mut periodic.task))
            });

            if let Err(panic) = outcome {
                warn!(
                    context = "scheduling_pool",
                    panic = %panic_message(panic.as_ref()),
                    "Periodic task panicked, it will not run again"
                );
                periodic.state.done.store(true, Ordering::SeqCst);
                return None;
            }

            periodic.state.runs.fetch_add(1, Ordering::SeqCst);

            if periodic.state.done.load(Ordering::SeqCst) {
                return None;
            }

            let next = match periodic.schedule {
                Repeat::FixedRate(period) => deadline + period,
                Repeat::FixedDelay(delay) => Instant::now() + delay,
            };

            Some(Entry::new(next, seq, Task::Periodic(periodic)))
        }
    }
}
