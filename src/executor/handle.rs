//! Cancelable handles for work submitted to a [super::SchedulingPool].

use std::cell::RefCell;
use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::panic_message;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Why a task produced no value.
pub enum TaskError {
    #[error("Task was cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("Pool was shut down before the task ran")]
    Shutdown,
}

thread_local! {
    static INTERRUPT: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

/// Returns true if the task running on this thread was cancelled with
/// `may_interrupt` set.
///
/// Tasks are never stopped forcibly; long running tasks are expected to
/// check this and return early.
pub fn interrupted() -> bool {
    INTERRUPT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    })
}

/// Publishes `flag` as the current thread's interrupt flag while `f` runs.
pub(crate) fn with_interrupt<R>(flag: &Arc<AtomicBool>, f: impl FnOnce() -> R) -> R {
    let previous = INTERRUPT.with(|current| current.borrow_mut().replace(flag.clone()));
    let result = f();
    INTERRUPT.with(|current| *current.borrow_mut() = previous);
    result
}

/// Something a pool thread can run.
pub(crate) trait Job: Send {
    fn run(self: Box<Self>);
}

/// A fire-and-forget closure.
pub(crate) struct Detached<F>(pub F);

impl<F: FnOnce() + Send> Job for Detached<F> {
    fn run(self: Box<Self>) {
        (self.0)()
    }
}

enum State<T> {
    Pending,
    Running,
    Finished(Result<T, TaskError>),
    Taken,
}

/// Shared state between a [TaskHandle] and the job that will fill it.
pub(crate) struct TaskCell<T> {
    state: Mutex<State<T>>,
    finished: Condvar,
    cancelled: AtomicBool,
    interrupt: Arc<AtomicBool>,
}

impl<T> TaskCell<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::Pending),
            finished: Condvar::new(),
            cancelled: AtomicBool::new(false),
            interrupt: Arc::new(AtomicBool::new(false)),
        })
    }

    fn finish(&self, result: Result<T, TaskError>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = State::Finished(result);
        self.finished.notify_all();
    }
}

/// Couples a closure with the cell its result goes to.
///
/// Dropping the job without running it, e.g. when the pool shuts down,
/// finishes the cell with [TaskError::Shutdown].
pub(crate) struct CellJob<T, F> {
    cell: Arc<TaskCell<T>>,
    task: Option<F>,
}

impl<T, F> CellJob<T, F>
where
    F: FnOnce() -> T,
{
    pub(crate) fn new(cell: Arc<TaskCell<T>>, task: F) -> Self {
        Self {
            cell,
            task: Some(task),
        }
    }
}

impl<T, F> Job for CellJob<T, F>
where
    T: Send,
    F: FnOnce() -> T + Send,
{
    fn run(mut self: Box<Self>) {
        let Some(task) = self.task.take() else {
            return;
        };

        {
            let mut state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                State::Pending => *state = State::Running,
                // Cancelled before it got to run.
                _ => return,
            }
        }

        let outcome = with_interrupt(&self.cell.interrupt, || {
            panic::catch_unwind(AssertUnwindSafe(task))
        });

        let result = if self.cell.cancelled.load(Ordering::SeqCst) {
            Err(TaskError::Cancelled)
        } else {
            outcome.map_err(|panic| TaskError::Panicked(panic_message(panic.as_ref())))
        };

        self.cell.finish(result);
    }
}

impl<T, F> Drop for CellJob<T, F> {
    fn drop(&mut self) {
        if self.task.is_some() {
            let mut state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
            if let State::Pending = *state {
                *state = State::Finished(Err(TaskError::Shutdown));
                self.cell.finished.notify_all();
            }
        }
    }
}

/// Handle to a one-off task and its eventual result.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>) -> Self {
        Self { cell }
    }

    /// Attempts to cancel the task.
    ///
    /// A task that has not started will never run. A running task keeps
    /// running, but its result is discarded, and with `may_interrupt` it can
    /// observe [interrupted]. Returns false if the task already finished.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        let mut state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);

        match *state {
            State::Pending => {
                self.cell.cancelled.store(true, Ordering::SeqCst);
                *state = State::Finished(Err(TaskError::Cancelled));
                self.cell.finished.notify_all();
                true
            }
            State::Running => {
                self.cell.cancelled.store(true, Ordering::SeqCst);
                if may_interrupt {
                    self.cell.interrupt.store(true, Ordering::SeqCst);
                }
                true
            }
            State::Finished(_) | State::Taken => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cell.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true once the task completed, panicked or was cancelled.
    pub fn is_done(&self) -> bool {
        let state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
        !matches!(*state, State::Pending | State::Running) || self.is_cancelled()
    }

    /// Blocks up to `timeout` for the task to finish. Returns true if it did.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (state, _) = self
            .cell
            .finished
            .wait_timeout_while(state, timeout, |state| {
                matches!(state, State::Pending | State::Running)
            })
            .unwrap_or_else(PoisonError::into_inner);

        !matches!(*state, State::Pending | State::Running)
    }

    /// Blocks until the task finishes and returns its result.
    pub fn join(self) -> Result<T, TaskError> {
        let state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self
            .cell
            .finished
            .wait_while(state, |state| {
                matches!(state, State::Pending | State::Running)
            })
            .unwrap_or_else(PoisonError::into_inner);

        match std::mem::replace(&mut *state, State::Taken) {
            State::Finished(result) => result,
            // Only `join` takes the result and it consumes the only handle.
            _ => Err(TaskError::Cancelled),
        }
    }
}

impl<T> Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Shared state of a repeating task.
#[derive(Debug, Default)]
pub(crate) struct PeriodicState {
    pub(crate) cancelled: AtomicBool,
    pub(crate) done: AtomicBool,
    pub(crate) interrupt: Arc<AtomicBool>,
    pub(crate) runs: AtomicU64,
}

/// Handle to a periodic task.
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
    state: Arc<PeriodicState>,
}

impl PeriodicHandle {
    pub(crate) fn new(state: Arc<PeriodicState>) -> Self {
        Self { state }
    }

    /// Stops future executions. An execution in progress finishes, and with
    /// `may_interrupt` it can observe [interrupted].
    ///
    /// Returns false if the task had already stopped.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        if self.state.done.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.state.cancelled.store(true, Ordering::SeqCst);
        if may_interrupt {
            self.state.interrupt.store(true, Ordering::SeqCst);
        }

        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Returns true once the task will not run again, because it was
    /// cancelled, panicked, or its pool shut down.
    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::SeqCst)
    }

    /// Number of completed executions.
    pub fn runs(&self) -> u64 {
        self.state.runs.load(Ordering::SeqCst)
    }
}
