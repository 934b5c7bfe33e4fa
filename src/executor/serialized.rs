//! At most one active executor, without a dedicated thread.

use std::fmt::{self, Debug, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use flume::{Receiver, Sender};
use tracing::error;

use super::panic_message;

type Item = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted work items one at a time on whichever submitting thread
/// currently holds the ownership flag.
///
/// Every item runs exactly once. Items that had to be queued run in FIFO
/// order, but a submitter that wins ownership runs its own item first, so
/// it may overtake items still waiting in the queue.
pub struct SerializedExecutor {
    active: AtomicBool,
    sender: Sender<Item>,
    receiver: Receiver<Item>,
}

impl SerializedExecutor {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            active: AtomicBool::new(false),
            sender,
            receiver,
        }
    }

    // === Getters ===

    /// Returns true while some thread is executing items.
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Items waiting for the current owner to pick them up.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    // === Public Methods ===

    /// Runs `item` now if no other thread is executing, otherwise queues it
    /// for the current owner and returns immediately.
    pub fn submit<F>(&self, item: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.try_acquire() {
            run(Box::new(item));
            self.drain();
            return;
        }

        // The receiver lives as long as self, sending can't fail.
        let _ = self.sender.send(Box::new(item));

        // The owner may have released between our failed acquire and the send.
        if self.try_acquire() {
            self.drain();
        }
    }

    // === Private Methods ===

    fn try_acquire(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Executes queued items until the queue is empty, then releases
    /// ownership. Re-acquires if something was queued during the release.
    fn drain(&self) {
        loop {
            while let Ok(item) = self.receiver.try_recv() {
                run(item);
            }

            self.active.store(false, Ordering::SeqCst);

            if self.receiver.is_empty() || !self.try_acquire() {
                return;
            }
        }
    }
}

impl Default for SerializedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SerializedExecutor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedExecutor")
            .field("active", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(item: Item) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(item)) {
        error!(
            context = "serialized_executor",
            panic = %panic_message(panic.as_ref()),
            "Work item panicked"
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use super::*;

    #[test]
    fn runs_inline_when_idle() {
        let executor = SerializedExecutor::new();
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));

        let slot = ran_on.clone();
        executor.submit(move || {
            *slot.lock().unwrap() = Some(thread::current().id());
        });

        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
        assert!(!executor.is_running());
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn nested_submissions_are_queued() {
        let executor = Arc::new(SerializedExecutor::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_executor = executor.clone();
        let inner_order = order.clone();
        executor.submit(move || {
            let nested_order = inner_order.clone();
            inner_executor.submit(move || nested_order.lock().unwrap().push("nested"));

            // Queued, not run re-entrantly.
            assert_eq!(inner_executor.pending(), 1);
            inner_order.lock().unwrap().push("outer");
        });

        assert_eq!(*order.lock().unwrap(), vec!["outer", "nested"]);
    }

    #[test]
    fn panicking_item_releases_ownership() {
        let executor = SerializedExecutor::new();
        let counter = Arc::new(AtomicUsize::new(0));

        executor.submit(|| panic!("boom"));

        let c = counter.clone();
        executor.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!executor.is_running());
    }

    #[test]
    fn exactly_once_from_many_threads() {
        const THREADS: usize = 8;
        const ITEMS: usize = 2_000;

        let executor = Arc::new(SerializedExecutor::new());
        let executed = Arc::new((0..THREADS * ITEMS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let executor = executor.clone();
                let executed = executed.clone();
                let concurrent = concurrent.clone();
                let max_concurrent = max_concurrent.clone();

                thread::spawn(move || {
                    for i in 0..ITEMS {
                        let executed = executed.clone();
                        let concurrent = concurrent.clone();
                        let max_concurrent = max_concurrent.clone();

                        executor.submit(move || {
                            let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                            max_concurrent.fetch_max(now, Ordering::SeqCst);
                            executed[t * ITEMS + i].fetch_add(1, Ordering::SeqCst);
                            concurrent.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Every submitter has returned, so any owner has drained and released.
        assert!(!executor.is_running());
        assert_eq!(executor.pending(), 0);
        assert!(executed.iter().all(|count| count.load(Ordering::SeqCst) == 1));
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
