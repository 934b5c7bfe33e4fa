use std::fmt::{self, Debug, Formatter};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Weak;
use std::time::Instant;

use mio::event::Event;
use mio::{Interest, Token};

use super::{Change, Shared};

/// A connection driven by a [super::Reactor].
///
/// The implementor owns the file descriptor; the reactor only registers it.
/// Callbacks run on the reactor thread, one at a time, and must not block.
/// Errors and panics are logged and never affect other connections.
///
/// Readiness is edge-triggered. An event is reported when the descriptor
/// becomes ready, not while it stays ready, so [Selectable::ready] has to
/// read or write until the descriptor returns
/// [std::io::ErrorKind::WouldBlock].
pub trait Selectable: AsRawFd + Send + Sync {
    /// Interest to register with. `None` attaches the connection for ticks
    /// only.
    fn interest(&self) -> Option<Interest> {
        Some(Interest::READABLE)
    }

    /// Called once the connection is attached, before any other callback.
    fn registered(&self, _handle: RegistrationHandle) {}

    /// The descriptor is ready for the operations in `event`.
    ///
    /// Drain the descriptor until it returns `WouldBlock`. Bytes left
    /// unread raise no further event until more data arrives. On Linux,
    /// requesting the current interest again through
    /// [RegistrationHandle::set_interest] re-arms the registration and
    /// reports readiness for data already buffered.
    fn ready(&self, event: &Event) -> io::Result<()>;

    /// Called every iteration, with or without I/O activity.
    fn tick(&self, _now: Instant) -> io::Result<()> {
        Ok(())
    }

    /// A change requested through [RegistrationHandle::set_interest] was applied.
    fn interest_applied(&self, _interest: Option<Interest>) {}
}

/// Handle to an attached connection's registration.
///
/// Changes are queued and applied by the reactor thread on its next
/// iteration. Several changes queued before that collapse into the latest.
#[derive(Clone)]
pub struct RegistrationHandle {
    token: Token,
    reactor: Weak<Shared>,
}

impl RegistrationHandle {
    pub(super) fn new(token: Token, reactor: Weak<Shared>) -> Self {
        Self { token, reactor }
    }

    // === Getters ===

    pub fn token(&self) -> Token {
        self.token
    }

    // === Public Methods ===

    /// Replaces the interest set. `None` stops readiness events but keeps
    /// the connection ticking.
    ///
    /// Returns false if the reactor is gone.
    pub fn set_interest(&self, interest: Option<Interest>) -> bool {
        self.send(Change::Interest(self.token, interest))
    }

    /// Detaches the connection. No callbacks follow once it is applied.
    ///
    /// Returns false if the reactor is gone.
    pub fn deregister(&self) -> bool {
        self.send(Change::Deregister(self.token))
    }

    // === Private Methods ===

    fn send(&self, change: Change) -> bool {
        match self.reactor.upgrade() {
            Some(shared) => {
                shared.change(change);
                true
            }
            None => false,
        }
    }
}

impl Debug for RegistrationHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationHandle")
            .field("token", &self.token)
            .finish()
    }
}
