//! Readiness multiplexing and periodic ticking for a dynamic set of
//! connections, on at most one lazily started worker thread.
//!
//! Callers never touch the poller. Registrations and interest changes are
//! queued and the worker is woken if it is blocked. Each iteration runs in a
//! fixed order: dispatch readiness events, tick every connection, attach
//! new registrations, apply interest changes.

pub mod config;
mod selectable;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error, trace, warn};

use crate::executor::panic_message;

pub use config::Config;
pub use selectable::{RegistrationHandle, Selectable};

const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
/// Owner slot value while no worker is running.
const NO_WORKER: u64 = 0;

/// Queued interest set update for an attached connection.
enum Change {
    Interest(Token, Option<Interest>),
    Deregister(Token),
}

struct Shared {
    config: Config,
    /// Only ever locked by the running worker.
    poll: Mutex<Poll>,
    waker: Waker,
    registrations: (Sender<Arc<dyn Selectable>>, Receiver<Arc<dyn Selectable>>),
    changes: (Sender<Change>, Receiver<Change>),
    /// Id of the running worker, or [NO_WORKER].
    owner: AtomicU64,
    next_worker: AtomicU64,
    workers_started: AtomicUsize,
    next_token: AtomicUsize,
    connections: AtomicUsize,
    /// Set while the worker is, or is about to be, blocked in poll.
    blocked: AtomicBool,
}

impl Shared {
    fn pending(&self) -> bool {
        !self.registrations.1.is_empty() || !self.changes.1.is_empty()
    }

    fn change(&self, change: Change) {
        // Both ends are owned by `self`, so sending never fails.
        let _ = self.changes.0.send(change);
        self.wake();
    }

    fn wake(&self) {
        if self.blocked.load(Ordering::SeqCst) {
            if let Err(error) = self.waker.wake() {
                warn!(context = "reactor", ?error, "Failed to wake the reactor");
            }
        }
    }
}

/// Multiplexes many [Selectable] connections over one poller.
///
/// The worker thread starts on the first registration and exits after
/// [Config::idle_iterations] iterations with nothing to serve. There is no
/// explicit stop: deregistering every connection is enough.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

impl Reactor {
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                poll: Mutex::new(poll),
                waker,
                registrations: flume::unbounded(),
                changes: flume::unbounded(),
                owner: AtomicU64::new(NO_WORKER),
                next_worker: AtomicU64::new(NO_WORKER + 1),
                workers_started: AtomicUsize::new(0),
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
                connections: AtomicUsize::new(0),
                blocked: AtomicBool::new(false),
            }),
        })
    }

    // === Getters ===

    /// Returns true while a worker thread is serving this reactor.
    pub fn worker_running(&self) -> bool {
        self.shared.owner.load(Ordering::SeqCst) != NO_WORKER
    }

    /// Worker threads started so far, including retired ones.
    pub fn workers_started(&self) -> usize {
        self.shared.workers_started.load(Ordering::SeqCst)
    }

    /// Attached connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    // === Public Methods ===

    /// Queues `selectable` for attachment, starting a worker if none is running.
    ///
    /// Returns an error only if a worker thread could not be spawned. The
    /// connection stays queued and is attached by the next worker.
    pub fn register(&self, selectable: Arc<dyn Selectable>) -> io::Result<()> {
        // Both ends are owned by `self.shared`, so sending never fails.
        let _ = self.shared.registrations.0.send(selectable);

        self.ensure_worker()
    }

    // === Private Methods ===

    fn ensure_worker(&self) -> io::Result<()> {
        let shared = &self.shared;
        let id = shared.next_worker.fetch_add(1, Ordering::SeqCst);

        if shared
            .owner
            .compare_exchange(NO_WORKER, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            shared.wake();
            return Ok(());
        }

        let worker_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name(shared.config.thread_name.clone())
            .spawn(move || worker(worker_shared, id));

        match spawned {
            Ok(_) => {
                shared.workers_started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(error) => {
                shared.owner.store(NO_WORKER, Ordering::SeqCst);
                warn!(context = "reactor", ?error, "Failed to spawn reactor worker");
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("worker_running", &self.worker_running())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// An attached connection, owned by the worker.
struct Connection {
    selectable: Arc<dyn Selectable>,
    interest: Option<Interest>,
}

fn worker(shared: Arc<Shared>, id: u64) {
    debug!(context = "reactor", id, "Reactor worker started");

    let mut poll = shared.poll.lock().unwrap_or_else(PoisonError::into_inner);
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut live: HashMap<Token, Connection> = HashMap::new();
    let mut idle = 0;

    loop {
        shared.blocked.store(true, Ordering::SeqCst);
        let timeout = if shared.pending() {
            Duration::ZERO
        } else {
            shared.config.select_timeout
        };
        let polled = poll.poll(&mut events, Some(timeout));
        shared.blocked.store(false, Ordering::SeqCst);

        if let Err(error) = polled {
            if error.kind() != ErrorKind::Interrupted {
                warn!(context = "reactor", ?error, "Poll failed");
            }
            events.clear();
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            if let Some(connection) = live.get(&event.token()) {
                guard(event.token(), "ready", || connection.selectable.ready(event));
            }
        }

        let now = Instant::now();
        for (token, connection) in &live {
            guard(*token, "tick", || connection.selectable.tick(now));
        }

        attach(&shared, poll.registry(), &mut live);
        apply_changes(&shared, poll.registry(), &mut live);

        shared.connections.store(live.len(), Ordering::SeqCst);

        if !live.is_empty() || !shared.registrations.1.is_empty() {
            idle = 0;
            continue;
        }

        idle += 1;
        if idle < shared.config.idle_iterations {
            continue;
        }

        shared.owner.store(NO_WORKER, Ordering::SeqCst);

        // A registration queued before the owner slot was cleared may have
        // skipped spawning a worker; take the slot back to serve it.
        if shared.registrations.1.is_empty()
            || shared
                .owner
                .compare_exchange(NO_WORKER, id, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            debug!(context = "reactor", id, "Reactor worker retiring");
            return;
        }

        idle = 0;
    }
}

fn attach(shared: &Arc<Shared>, registry: &Registry, live: &mut HashMap<Token, Connection>) {
    for selectable in shared.registrations.1.try_iter() {
        let token = Token(shared.next_token.fetch_add(1, Ordering::SeqCst));
        let interest = selectable.interest();

        if let Some(interest) = interest {
            let fd = selectable.as_raw_fd();
            if let Err(error) = registry.register(&mut SourceFd(&fd), token, interest) {
                warn!(context = "reactor", ?token, ?error, "Failed to register connection, dropping it");
                continue;
            }
        }

        trace!(context = "reactor", ?token, ?interest, "Attached connection");

        let handle = RegistrationHandle::new(token, Arc::downgrade(shared));
        guard(token, "registered", || {
            selectable.registered(handle);
            Ok(())
        });

        live.insert(
            token,
            Connection {
                selectable,
                interest,
            },
        );
    }
}

fn apply_changes(shared: &Shared, registry: &Registry, live: &mut HashMap<Token, Connection>) {
    let mut latest: HashMap<Token, Option<Option<Interest>>> = HashMap::new();

    for change in shared.changes.1.try_iter() {
        match change {
            Change::Interest(token, interest) => match latest.entry(token) {
                // Deregistration wins over any later interest change.
                Entry::Occupied(mut entry) => {
                    if entry.get().is_some() {
                        entry.insert(Some(interest));
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(Some(interest));
                }
            },
            Change::Deregister(token) => {
                latest.insert(token, None);
            }
        }
    }

    for (token, change) in latest {
        let Some(connection) = live.get_mut(&token) else {
            continue;
        };
        let fd = connection.selectable.as_raw_fd();

        let Some(interest) = change else {
            if connection.interest.is_some() {
                if let Err(error) = registry.deregister(&mut SourceFd(&fd)) {
                    debug!(context = "reactor", ?token, ?error, "Deregistering a closed descriptor");
                }
            }
            live.remove(&token);
            trace!(context = "reactor", ?token, "Detached connection");
            continue;
        };

        let result = match (connection.interest, interest) {
            (None, None) => Ok(()),
            (None, Some(interest)) => registry.register(&mut SourceFd(&fd), token, interest),
            (Some(_), Some(interest)) => registry.reregister(&mut SourceFd(&fd), token, interest),
            (Some(_), None) => registry.deregister(&mut SourceFd(&fd)),
        };

        match result {
            Ok(()) => {
                connection.interest = interest;
                let selectable = connection.selectable.clone();
                guard(token, "interest_applied", || {
                    selectable.interest_applied(interest);
                    Ok(())
                });
            }
            Err(error) => {
                warn!(context = "reactor", ?token, ?error, "Failed to change interest, dropping connection");
                live.remove(&token);
            }
        }
    }
}

/// Runs a connection callback, logging errors and panics instead of
/// letting them reach the loop.
fn guard(token: Token, callback: &'static str, f: impl FnOnce() -> io::Result<()>) {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(error)) => {
            warn!(context = "reactor", ?token, callback, ?error, "Connection callback failed");
        }
        Err(panic) => {
            error!(
                context = "reactor",
                ?token,
                callback,
                panic = %panic_message(panic.as_ref()),
                "Connection callback panicked"
            );
        }
    }
}
