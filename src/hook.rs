//! The transparent blocking adapter: turns "would block" into "register
//! for readiness, suspend, retry," with per-operation timeouts.
//!
//! This is consumed by [`crate::net`]'s `HookedTcpStream`/`HookedTcpListener`,
//! the one concrete place in this crate that has raw descriptor operations
//! to hook. Per spec.md §9's design note, there is no global dynamic-symbol
//! interposition here; `do_io` is a function callers invoke explicitly
//! around their own non-blocking operation, the same shape as the
//! teacher's `coio_wait`-based helpers in `coio.rs`.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::descriptor::DescriptorTable;
use crate::event::{EventKind, FireReason};
use crate::fiber::{self, FiberHandle};
use crate::io_manager::IOManager;
use crate::scheduler::Scheduler;

thread_local! {
    static HOOKS_ENABLED: Cell<bool> = Cell::new(false);
}

/// Per-thread switch for the hook layer. Off by default outside a
/// scheduler; `Scheduler`'s dispatch loop turns it on for the duration of
/// each worker thread's (or use-caller thread's) run.
pub fn set_hooks_enabled(enabled: bool) {
    HOOKS_ENABLED.with(|c| c.set(enabled));
}

pub(crate) fn hooks_enabled() -> bool {
    HOOKS_ENABLED.with(|c| c.get())
}

/// Which of a descriptor's two configured timeouts applies to an
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    Recv,
    Send,
}

enum WaitOutcome {
    Ready,
    TimedOut,
    Cancelled,
}

/// The generic adapter from spec.md §4.5: attempt `op`, and on would-block
/// register for `event` (with an optional timeout) and suspend, retrying
/// once woken. Retries transparently on `EINTR`. Bypasses all of this
/// entirely when hooks are disabled, the descriptor isn't a socket, or the
/// caller asked for real non-blocking semantics.
pub(crate) fn do_io<T>(
    io: &Arc<IOManager>,
    descriptors: &DescriptorTable,
    fd: RawFd,
    event: EventKind,
    timeout_kind: TimeoutKind,
    mut op: impl FnMut() -> io::Result<T>,
) -> crate::Result<T> {
    let meta = descriptors.get_or_init(fd, true);
    if !hooks_enabled() || !meta.is_socket() || meta.is_user_nonblock() {
        return op().map_err(crate::Error::Io);
    }
    let timeout_ms = match timeout_kind {
        TimeoutKind::Recv => meta.recv_timeout_ms(),
        TimeoutKind::Send => meta.send_timeout_ms(),
    };
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => match wait_for_ready(io, fd, event, timeout_ms)? {
                WaitOutcome::Ready => continue,
                WaitOutcome::TimedOut => return Err(crate::Error::TimedOut),
                WaitOutcome::Cancelled => return Err(crate::Error::Interrupted),
            },
            Err(e) => return Err(crate::Error::Io(e)),
        }
    }
}

/// Parks the current fiber until `fd` becomes ready for `event`, `timeout_ms`
/// elapses, or someone else calls `cancel_event`/`cancel_all` on it.
fn wait_for_ready(io: &Arc<IOManager>, fd: RawFd, event: EventKind, timeout_ms: Option<i64>) -> crate::Result<WaitOutcome> {
    let outcome: Arc<Mutex<Option<WaitOutcome>>> = Arc::new(Mutex::new(None));
    let fiber: FiberHandle = fiber::current();
    let scheduler: Arc<Scheduler> = Scheduler::current().expect("do_io called outside of a scheduler");

    // A conditional timer, per spec.md §4.5 step 3a: its witness is a
    // small marker object whose only job is to stand in for "this wait is
    // still in flight." `cancel_event` below fires through the very same
    // registration, whichever side gets there first.
    let timer_guard = timeout_ms.map(|ms| {
        let witness = Arc::new(());
        let weak_witness: Weak<dyn Any + Send + Sync> = Arc::downgrade(&witness) as Weak<dyn Any + Send + Sync>;
        let outcome = outcome.clone();
        let io = io.clone();
        let handle = io.timers().add_conditional_timer(
            ms,
            move || {
                *outcome.lock().unwrap() = Some(WaitOutcome::TimedOut);
                io.cancel_event(fd, event);
            },
            weak_witness,
            false,
        );
        (handle, witness)
    });

    let outcome_for_event = outcome.clone();
    io.add_event_with_reason(
        fd,
        event,
        Box::new(move |reason| {
            let mut slot = outcome_for_event.lock().unwrap();
            if slot.is_none() {
                *slot = Some(match reason {
                    FireReason::Ready => WaitOutcome::Ready,
                    FireReason::Cancelled => WaitOutcome::Cancelled,
                });
            }
            drop(slot);
            scheduler.schedule_fiber(fiber.clone(), None);
        }),
    )?;

    fiber::yield_hold();

    if let Some((handle, _witness)) = timer_guard {
        handle.cancel();
    }

    Ok(outcome.lock().unwrap().take().unwrap_or(WaitOutcome::Cancelled))
}

/// Sleep family: register a one-shot timer that reschedules the current
/// fiber, then suspend. Mirrors `usleep`/`nanosleep` in the original. Must
/// be called from within a fiber running under `io`'s scheduler.
pub fn sleep_ms(io: &Arc<IOManager>, ms: i64) {
    let fiber = fiber::current();
    let scheduler = Scheduler::current().expect("hook::sleep_ms called outside of a scheduler");
    io.timers().add_timer(
        ms,
        move || scheduler.schedule_fiber(fiber.clone(), None),
        false,
    );
    fiber::yield_hold();
}

/// Connects `stream` (already returned non-blocking and possibly still
/// `EINPROGRESS` by `mio::net::TcpStream::connect`), waiting up to
/// `tcp.connect.timeout` milliseconds for the socket to become writable,
/// then checking `SO_ERROR` to tell success from failure.
pub(crate) fn connect_timeout(io: &Arc<IOManager>, descriptors: &DescriptorTable, stream: &mio::net::TcpStream) -> crate::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = stream.as_raw_fd();
    descriptors.get_or_init(fd, true);
    if !hooks_enabled() {
        return match stream.take_error().map_err(crate::Error::Io)? {
            Some(e) => Err(crate::Error::Io(e)),
            None => Ok(()),
        };
    }
    let timeout_ms: i64 = crate::config::get_or("tcp.connect.timeout", 5000i64);
    match wait_for_ready(io, fd, EventKind::Write, Some(timeout_ms))? {
        WaitOutcome::TimedOut => return Err(crate::Error::TimedOut),
        WaitOutcome::Cancelled => return Err(crate::Error::Interrupted),
        WaitOutcome::Ready => {}
    }
    match stream.take_error().map_err(crate::Error::Io)? {
        Some(e) => Err(crate::Error::Io(e)),
        None => Ok(()),
    }
}

/// Cancels every pending event on `fd` (waking parked fibers with
/// `Interrupted` before the descriptor goes away) and destroys its
/// metadata. The actual kernel `close` is left to the caller's `Drop`,
/// letting `mio`'s socket types close their own fd exactly once.
pub(crate) fn close(io: &IOManager, descriptors: &DescriptorTable, fd: RawFd) {
    io.cancel_all(fd);
    descriptors.remove(fd);
}

/// Socket option interception: receive/send timeouts are recorded in
/// descriptor metadata rather than pushed down to the kernel socket.
pub(crate) fn set_recv_timeout_ms(descriptors: &DescriptorTable, fd: RawFd, ms: Option<i64>) {
    descriptors.get_or_init(fd, true).set_recv_timeout_ms(ms);
}

pub(crate) fn set_send_timeout_ms(descriptors: &DescriptorTable, fd: RawFd, ms: Option<i64>) {
    descriptors.get_or_init(fd, true).set_send_timeout_ms(ms);
}

/// Records that the caller explicitly wants real non-blocking behavior on
/// `fd`; `do_io` then calls straight through instead of hooking it.
pub(crate) fn set_user_nonblock(descriptors: &DescriptorTable, fd: RawFd, value: bool) {
    descriptors.get_or_init(fd, true).set_user_nonblock(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_is_cooperative() {
        let io = IOManager::new(2, false, "test").unwrap();
        io.start();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o_a = order.clone();
        let io_a = io.clone();
        let a = crate::fiber::Fiber::new("a", 65536, move || {
            sleep_ms(&io_a, 80);
            o_a.lock().unwrap().push("A");
        });
        let o_b = order.clone();
        let b = crate::fiber::Fiber::new("b", 65536, move || {
            o_b.lock().unwrap().push("B");
        });
        io.schedule(crate::scheduler::Schedulable::Fiber(a), None);
        io.schedule(crate::scheduler::Schedulable::Fiber(b), None);

        let start = std::time::Instant::now();
        io.stop();
        assert!(start.elapsed() < std::time::Duration::from_millis(500));
        assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);
    }

    #[test]
    fn hooks_disabled_outside_scheduler_by_default() {
        assert!(!hooks_enabled());
    }

    #[test]
    fn recv_timeout_roundtrips_through_descriptor_metadata() {
        let descriptors = DescriptorTable::new();
        let fd = unsafe {
            let mut fds = [0i32; 2];
            libc::pipe(fds.as_mut_ptr());
            libc::close(fds[1]);
            fds[0]
        };
        set_recv_timeout_ms(&descriptors, fd, Some(250));
        assert_eq!(descriptors.get(fd).unwrap().recv_timeout_ms(), Some(250));
        unsafe { libc::close(fd) };
    }
}
