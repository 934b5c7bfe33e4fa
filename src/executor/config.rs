use std::time::Duration;

/// Default time an extra immediate worker waits for work before exiting.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Default number of threads serving delayed and periodic tasks.
pub const DEFAULT_SCHEDULED_THREADS: usize = 2;

#[derive(Debug, Clone)]
/// Scheduling pool configurations
pub struct Config {
    /// Immediate workers kept alive even when idle.
    ///
    /// Defaults to the available parallelism.
    pub core_threads: usize,
    /// Upper bound of immediate workers while tasks are backing up.
    ///
    /// Defaults to twice `core_threads`.
    pub max_threads: usize,
    /// How long a worker above `core_threads` waits for work before exiting.
    ///
    /// Defaults to [DEFAULT_KEEP_ALIVE]
    pub keep_alive: Duration,
    /// Threads serving delayed, periodic and long running tasks.
    ///
    /// Defaults to [DEFAULT_SCHEDULED_THREADS]
    pub scheduled_threads: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        let core_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            core_threads,
            max_threads: core_threads * 2,
            keep_alive: DEFAULT_KEEP_ALIVE,
            scheduled_threads: DEFAULT_SCHEDULED_THREADS,
            thread_name: "mainline-pool".to_string(),
        }
    }
}
