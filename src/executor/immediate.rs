//! Pool for short lived tasks, fed through an unbounded queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use super::handle::Job;
use super::run_job;

struct Shared {
    receiver: Receiver<Box<dyn Job>>,
    core: usize,
    max: usize,
    keep_alive: Duration,
    name: String,
    /// Live worker threads.
    threads: AtomicUsize,
    /// Workers blocked waiting for a job.
    idle: AtomicUsize,
}

impl Shared {
    /// Adds a worker while below `core`, or while queued jobs outnumber
    /// idle workers and we are below `max`.
    ///
    /// Called by submitters after queueing and by workers after taking a
    /// job, so whichever of the two observes the backlog last grows the pool.
    fn grow(self: &Arc<Self>) {
        let threads = loop {
            let threads = self.threads.load(Ordering::SeqCst);
            let backlog = self.receiver.len() > self.idle.load(Ordering::SeqCst);

            if threads >= self.max || (threads >= self.core && !backlog) {
                return;
            }

            if self
                .threads
                .compare_exchange(threads, threads + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break threads;
            }
        };

        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.name, threads))
            .spawn(move || worker(shared));

        if let Err(error) = spawned {
            self.threads.fetch_sub(1, Ordering::SeqCst);
            warn!(context = "scheduling_pool", ?error, "Failed to spawn worker");
        }
    }
}

/// Grows from `core` up to `max` workers while jobs back up, and shrinks
/// back to `core` once the extra workers sit idle for `keep_alive`.
pub(crate) struct ImmediatePool {
    sender: Mutex<Option<Sender<Box<dyn Job>>>>,
    shared: Arc<Shared>,
}

impl ImmediatePool {
    pub(crate) fn new(core: usize, max: usize, keep_alive: Duration, name: String) -> Self {
        let (sender, receiver) = flume::unbounded();
        let core = core.max(1);

        Self {
            sender: Mutex::new(Some(sender)),
            shared: Arc::new(Shared {
                receiver,
                core,
                max: max.max(core),
                keep_alive,
                name,
                threads: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
        }
    }

    pub(crate) fn threads(&self) -> usize {
        self.shared.threads.load(Ordering::SeqCst)
    }

    /// Queues `job`. Returns it back if the pool was shut down.
    pub(crate) fn execute(&self, job: Box<dyn Job>) -> Result<(), Box<dyn Job>> {
        {
            let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = sender.as_ref() else {
                return Err(job);
            };
            sender.send(job).map_err(|error| error.into_inner())?;
        }

        self.shared.grow();

        Ok(())
    }

    /// Stops accepting jobs. Queued jobs still run, then the workers exit.
    pub(crate) fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn worker(shared: Arc<Shared>) {
    trace!(context = "scheduling_pool", "Immediate worker started");

    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let extra = shared.threads.load(Ordering::SeqCst) > shared.core;
        let received = if extra {
            shared.receiver.recv_timeout(shared.keep_alive)
        } else {
            shared
                .receiver
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected)
        };
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(job) => {
                shared.grow();
                run_job(job);
            }
            Err(RecvTimeoutError::Timeout) => {
                let threads = shared.threads.load(Ordering::SeqCst);
                if threads > shared.core
                    && shared
                        .threads
                        .compare_exchange(threads, threads - 1, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    trace!(context = "scheduling_pool", "Idle immediate worker retiring");
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.threads.fetch_sub(1, Ordering::SeqCst);
                trace!(context = "scheduling_pool", "Immediate worker stopped");
                return;
            }
        }
    }
}
