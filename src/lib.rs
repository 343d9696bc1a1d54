//! A cooperative, user-space concurrency runtime.
//!
//! - [Fibers](fiber): stackful, cooperatively scheduled units of execution.
//! - [Scheduler](scheduler): a fixed pool of worker threads draining a
//!   shared ready queue of fibers and callbacks.
//! - [IOManager](io_manager): a scheduler whose idle step polls a kernel
//!   event demultiplexer and a [timer set](timer), so fibers parked on I/O
//!   or a deadline get woken without spinning.
//! - [Hooks](hook): turns a non-blocking socket's `WouldBlock` into
//!   "register for readiness, suspend the fiber, retry," so code written
//!   against [`net::HookedTcpStream`]/[`net::HookedTcpListener`] reads like
//!   ordinary blocking I/O.
//! - A fiber-cooperative [condition variable](fiber::Cond) and
//!   [channel](channel).
//!
//! ### A caution about blocking
//!
//! Every worker thread in a [`Scheduler`](scheduler::Scheduler) multiplexes
//! many fibers. An OS-level `Mutex`, `RwLock`, or blocking syscall doesn't
//! just block the one fiber that calls it; it blocks the entire worker
//! thread, and every other fiber currently resident on it, until the call
//! returns. Use [`fiber::Cond`] and [`channel`] for cross-fiber
//! synchronization instead; reach for [`hook::do_io`]/[`net`] rather than
//! std's blocking socket types for I/O.
//!
//! ### Configuration
//!
//! Runtime-tunable knobs (fiber stack size, connect timeout) live in
//! [`config`], a small YAML-backed registry. See its module docs for the
//! known keys.

pub mod channel;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod event;
pub mod fiber;
pub mod hook;
pub mod io_manager;
pub mod net;
pub mod scheduler;
pub mod timer;

pub use error::{Error, Result};
pub use event::{EventKind, FireReason};
pub use fiber::{current as current_fiber, yield_hold, yield_ready, Fiber, FiberHandle, State as FiberState};
pub use hook::{set_hooks_enabled, sleep_ms};
pub use io_manager::IOManager;
pub use scheduler::{Schedulable, Scheduler};
pub use timer::{Timer, TimerHandle, TimerManager};

use std::sync::Arc;

/// Convenience constructor matching spec.md §6's `new_io_manager(threads,
/// use_caller, name)`: a [`Scheduler`] with its idle step wired up to a
/// real event demultiplexer and timer set.
pub fn new_io_manager(threads: usize, use_caller: bool, name: impl Into<String>) -> std::io::Result<Arc<IOManager>> {
    IOManager::new(threads, use_caller, name)
}
