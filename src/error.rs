//! Error handling utils.
//!
//! Error kinds are the ones named in the design: `already-registered`,
//! `bad-descriptor`, `would-block-timeout`, `operation-interrupted`. Errors
//! that denote a programmer mistake rather than a runtime condition (adding
//! an event that already exists in the table, stopping a scheduler that was
//! never started, resuming a terminal fiber) are not represented here at
//! all; they `panic!` at the call site with a diagnostic, per the crate's
//! propagation policy: invariant violations abort, they don't propagate.

use std::io;
use std::os::unix::io::RawFd;

use crate::event::EventKind;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all recoverable error cases raised by this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// `add_event` was called for an `(fd, event)` pair that is already
    /// registered. See [`crate::io_manager::IOManager::add_event`].
    #[error("event {event:?} is already registered on fd {fd}")]
    AlreadyRegistered { fd: RawFd, event: EventKind },

    /// The descriptor is closed, was never registered, or the table has no
    /// entry for it.
    #[error("bad descriptor: {0}")]
    BadDescriptor(RawFd),

    /// A hooked operation's configured timeout elapsed before the
    /// descriptor became ready. Surfaced to callers the same way the
    /// platform surfaces a socket timeout.
    #[error("operation timed out")]
    TimedOut,

    /// The fiber parked on this operation was woken by
    /// [`crate::io_manager::IOManager::cancel_event`] or
    /// [`crate::io_manager::IOManager::cancel_all`] rather than by I/O
    /// readiness.
    #[error("operation was interrupted")]
    Interrupted,

    /// Underlying OS I/O error, for anything `do_io` doesn't turn into one
    /// of the above.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True if this is the error [`crate::hook::do_io`] produces when a
    /// per-operation timeout elapses; callers that want to distinguish
    /// "timed out" from "really failed" can match on this instead of the
    /// full enum.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::TimedOut => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            Error::Interrupted => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
            Error::BadDescriptor(_) => {
                io::Error::new(io::ErrorKind::NotConnected, e.to_string())
            }
            Error::AlreadyRegistered { .. } => {
                io::Error::new(io::ErrorKind::AlreadyExists, e.to_string())
            }
            Error::Io(inner) => inner,
        }
    }
}
