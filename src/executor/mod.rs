//! Cooperative task execution: a lock-free serialized executor and a
//! hybrid pool splitting immediate work from scheduled work.

pub mod config;
mod handle;
mod immediate;
mod scheduled;
mod serialized;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use handle::{CellJob, Detached, Job, PeriodicState, TaskCell};
use immediate::ImmediatePool;
use scheduled::{Entry, Periodic, Repeat, ScheduledPool, Task};

pub use config::Config;
pub use handle::{interrupted, PeriodicHandle, TaskError, TaskHandle};
pub use serialized::SerializedExecutor;

/// Two isolated pools behind one interface.
///
/// Short tasks go to an immediate pool with an unbounded queue. Delayed,
/// periodic and long running tasks go to a separate scheduled pool, so they
/// can never starve immediate dispatch. One-off delayed submissions reach
/// the scheduled queue through a [SerializedExecutor], so concurrent
/// schedulers do not contend on the queue lock.
pub struct SchedulingPool {
    immediate: ImmediatePool,
    scheduled: ScheduledPool,
    funnel: SerializedExecutor,
}

impl SchedulingPool {
    pub fn new(config: Config) -> std::io::Result<Self> {
        let scheduled = ScheduledPool::new(config.scheduled_threads, &config.thread_name)?;

        debug!(
            context = "scheduling_pool",
            core = config.core_threads,
            max = config.max_threads,
            scheduled = config.scheduled_threads,
            "Starting scheduling pool"
        );

        Ok(Self {
            immediate: ImmediatePool::new(
                config.core_threads,
                config.max_threads,
                config.keep_alive,
                config.thread_name,
            ),
            scheduled,
            funnel: SerializedExecutor::new(),
        })
    }

    // === Getters ===

    /// Live immediate worker threads.
    pub fn immediate_threads(&self) -> usize {
        self.immediate.threads()
    }

    /// Tasks waiting in the scheduled queue, including cancelled ones not
    /// yet reached.
    pub fn scheduled_len(&self) -> usize {
        self.scheduled.queued()
    }

    // === Public Methods ===

    /// Runs `task` on the immediate pool.
    ///
    /// Panics are logged. Tasks submitted after [Self::shutdown] are dropped.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.immediate.execute(Box::new(Detached(task))).is_err() {
            debug!(context = "scheduling_pool", "Dropped task submitted after shutdown");
        }
    }

    /// Runs `task` on the immediate pool and returns a handle to its result.
    pub fn spawn<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let cell = TaskCell::new();
        // A rejected job is dropped here, finishing the handle with `Shutdown`.
        let _ = self.immediate.execute(Box::new(CellJob::new(cell.clone(), task)));
        TaskHandle::new(cell)
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<T, F>(&self, delay: Duration, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Runs `task` once at `deadline`.
    ///
    /// Tasks with equal deadlines run in submission order.
    pub fn schedule_at<T, F>(&self, deadline: Instant, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let cell = TaskCell::new();
        let entry = Entry::new(
            deadline,
            self.scheduled.next_seq(),
            Task::Once(Box::new(CellJob::new(cell.clone(), task))),
        );

        self.funnel.submit(self.scheduled.inserter(entry));

        TaskHandle::new(cell)
    }

    /// Runs `task` on the scheduled pool as soon as a thread is free.
    ///
    /// Meant for long running work that should not occupy immediate workers.
    pub fn submit_scheduled<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let cell = TaskCell::new();
        self.scheduled.insert(Entry::new(
            Instant::now(),
            self.scheduled.next_seq(),
            Task::Once(Box::new(CellJob::new(cell.clone(), task))),
        ));

        TaskHandle::new(cell)
    }

    /// Runs `task` after `initial_delay`, then every `period` measured from
    /// one scheduled start to the next.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> PeriodicHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.periodic(initial_delay, Repeat::FixedRate(period), Box::new(task))
    }

    /// Runs `task` after `initial_delay`, then again `delay` after each run
    /// finishes.
    pub fn schedule_with_fixed_delay<F>(
        &self,
        initial_delay: Duration,
        delay: Duration,
        task: F,
    ) -> PeriodicHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.periodic(initial_delay, Repeat::FixedDelay(delay), Box::new(task))
    }

    /// Stops both pools.
    ///
    /// Queued immediate tasks still run. Scheduled tasks that have not
    /// started never will: their handles finish with [TaskError::Shutdown]
    /// and periodic handles report done.
    pub fn shutdown(&self) {
        self.immediate.shutdown();
        self.scheduled.shutdown();
    }

    // === Private Methods ===

    fn periodic(
        &self,
        initial_delay: Duration,
        schedule: Repeat,
        task: Box<dyn FnMut() + Send>,
    ) -> PeriodicHandle {
        let state = Arc::new(PeriodicState::default());

        self.scheduled.insert(Entry::new(
            Instant::now() + initial_delay,
            self.scheduled.next_seq(),
            Task::Periodic(Periodic {
                state: state.clone(),
                schedule,
                task,
            }),
        ));

        PeriodicHandle::new(state)
    }
}

impl Drop for SchedulingPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Runs a job, keeping a panic from taking down the pool thread.
///
/// Jobs carrying a result handle catch their own panics; this only sees
/// panics from fire-and-forget tasks.
fn run_job(job: Box<dyn Job>) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
        error!(
            context = "scheduling_pool",
            panic = %panic_message(panic.as_ref()),
            "Task panicked"
        );
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
