use std::time::Duration;

/// Default bound on a single wait for readiness, which is also the tick period.
pub const DEFAULT_SELECT_TIMEOUT: Duration = Duration::from_millis(100);

/// Default number of empty iterations before the worker thread retires.
pub const DEFAULT_IDLE_ITERATIONS: usize = 50;

#[derive(Debug, Clone)]
/// Reactor configurations
pub struct Config {
    /// Longest the worker blocks waiting for readiness before ticking
    /// every connection.
    ///
    /// Defaults to [DEFAULT_SELECT_TIMEOUT]
    pub select_timeout: Duration,
    /// Iterations without connections or pending registrations after which
    /// the worker exits. A later registration starts a new one.
    ///
    /// Defaults to [DEFAULT_IDLE_ITERATIONS]
    pub idle_iterations: usize,
    /// Name of the worker thread.
    pub thread_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            select_timeout: DEFAULT_SELECT_TIMEOUT,
            idle_iterations: DEFAULT_IDLE_ITERATIONS,
            thread_name: "mainline-reactor".to_string(),
        }
    }
}
