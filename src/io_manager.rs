//! The event-driven idle loop: a [`Scheduler`] extended with a kernel
//! event demultiplexer, a descriptor→event-context table, a self-pipe for
//! cross-thread wakeups, and a [`TimerManager`].
//!
//! Rust has no virtual inheritance, so "`IOManager` is a `Scheduler` with a
//! real idle step" is built as composition: `IOManager` embeds an
//! `Arc<Scheduler>` (via [`Deref`]) and plugs its own idle/termination/
//! wakeup behavior into it through the `set_*_hook` injection points.

use std::collections::HashSet;
use std::io;
use std::ops::Deref;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::descriptor::DescriptorTable;
use crate::event::{EventKind, EventMask, EventTable, Handler};
use crate::fiber;
use crate::scheduler::{Schedulable, Scheduler};
use crate::timer::{TimerManager, NO_DEADLINE};

/// Bound on how long a single idle step blocks in the demultiplexer, so
/// clock corrections and safety timers still make progress even with no
/// timer registered. Per spec.md §4.4.
const MAX_EVENT_WAIT: Duration = Duration::from_secs(3);

const WAKEUP_TOKEN: Token = Token(usize::MAX);

pub struct IOManager {
    scheduler: Arc<Scheduler>,
    events: EventTable,
    descriptors: DescriptorTable,
    timers: Arc<TimerManager>,
    poll: Mutex<Poll>,
    registered_fds: Mutex<HashSet<RawFd>>,
    wakeup_read_fd: RawFd,
    wakeup_write_fd: RawFd,
}

impl Deref for IOManager {
    type Target = Scheduler;
    fn deref(&self) -> &Scheduler {
        &self.scheduler
    }
}

impl IOManager {
    /// `new_io_manager(threads, use_caller, name)` from spec.md §6.
    pub fn new(threads: usize, use_caller: bool, name: impl Into<String>) -> io::Result<Arc<IOManager>> {
        let scheduler = Scheduler::new(threads, use_caller, name);
        let poll = Poll::new()?;
        let (wakeup_read_fd, wakeup_write_fd) = make_wakeup_pipe()?;
        poll.registry()
            .register(&mut SourceFd(&wakeup_read_fd), WAKEUP_TOKEN, Interest::READABLE)?;

        let manager = Arc::new(IOManager {
            scheduler,
            events: EventTable::new(),
            descriptors: DescriptorTable::new(),
            timers: TimerManager::new(),
            poll: Mutex::new(poll),
            registered_fds: Mutex::new(HashSet::new()),
            wakeup_read_fd,
            wakeup_write_fd,
        });

        let idle_target = Arc::downgrade(&manager);
        manager.scheduler.set_idle_hook(Box::new(move || {
            if let Some(m) = idle_target.upgrade() {
                m.idle_step();
            }
        }));

        manager.scheduler.set_wakeup_hook(Box::new({
            let fd = wakeup_write_fd;
            move || tickle_pipe(fd)
        }));

        let term_target = Arc::downgrade(&manager);
        manager.scheduler.set_termination_guard(Box::new(move || {
            term_target
                .upgrade()
                .map_or(true, |m| m.events.total_registered() == 0 && m.timers.is_empty())
        }));

        let timer_target = Arc::downgrade(&manager);
        manager.timers.set_on_first_changed(Box::new(move || {
            if let Some(m) = timer_target.upgrade() {
                m.scheduler.tickle();
            }
        }));

        Ok(manager)
    }

    pub fn start(self: &Arc<Self>) {
        self.scheduler.start();
    }

    /// Requests termination. Unlike the base `Scheduler`, this only
    /// finishes once no events or timers remain either, per the
    /// termination guard installed in `new`.
    pub fn stop(self: &Arc<Self>) {
        self.scheduler.stop();
    }

    pub fn schedule(self: &Arc<Self>, item: Schedulable, thread: Option<usize>) {
        self.scheduler.schedule(item, thread);
    }

    pub fn schedule_batch<I: IntoIterator<Item = Schedulable>>(self: &Arc<Self>, items: I) {
        self.scheduler.schedule_batch(items);
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// Per-descriptor metadata table, used by [`crate::hook`] and
    /// [`crate::net`]. Not part of the public API: a `DescriptorTable`,
    /// like the event table, is owned and encapsulated by exactly one
    /// `IOManager`.
    pub(crate) fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Current value of the pending-event counter: the invariant from
    /// spec.md §8 says this must equal the popcount sum across every
    /// descriptor's registered mask. Derived directly from the event table
    /// rather than tracked in a second counter, so there's only one source
    /// of truth to race against (see `EventTable::total_registered`).
    pub fn pending_event_count(&self) -> u32 {
        self.events.total_registered()
    }

    /// Registers interest in `event` on `fd`. If `handler` is `None`, the
    /// currently executing fiber is captured and woken when the event
    /// fires or is cancelled. Fails if `event` is already registered on
    /// `fd`.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, event: EventKind, handler: Option<Box<dyn FnOnce() + Send>>) -> crate::Result<()> {
        let handler = match handler {
            Some(cb) => Handler::Callback(Box::new(move |_reason| cb())),
            None => Handler::Fiber(fiber::current()),
        };
        self.register_handler(fd, event, handler)
    }

    /// Like [`add_event`](Self::add_event), but the callback is told why it
    /// fired. Used by [`crate::hook::do_io`], which needs to distinguish a
    /// genuinely-ready descriptor from an explicit `cancel_event` call.
    pub(crate) fn add_event_with_reason(
        self: &Arc<Self>,
        fd: RawFd,
        event: EventKind,
        cb: Box<dyn FnOnce(crate::event::FireReason) + Send>,
    ) -> crate::Result<()> {
        self.register_handler(fd, event, Handler::Callback(cb))
    }

    fn register_handler(self: &Arc<Self>, fd: RawFd, event: EventKind, handler: Handler) -> crate::Result<()> {
        self.events.add(fd, event, self.scheduler.clone(), handler)?;
        self.sync_registration(fd);
        Ok(())
    }

    /// Removes interest without invoking the handler.
    pub fn del_event(&self, fd: RawFd, event: EventKind) {
        self.events.del(fd, event);
        self.sync_registration(fd);
    }

    /// Removes interest and fires the handler (the canonical way to wake a
    /// fiber parked on this event from somewhere else).
    pub fn cancel_event(&self, fd: RawFd, event: EventKind) {
        self.events.cancel(fd, event);
        self.sync_registration(fd);
    }

    /// Fires every pending handler registered on `fd`. Used by `close`.
    pub fn cancel_all(&self, fd: RawFd) {
        self.events.cancel_all(fd);
        self.sync_registration(fd);
    }

    fn sync_registration(&self, fd: RawFd) {
        let mask = self.events.mask_of(fd);
        if mask.is_empty() {
            self.deregister_fd(fd);
        } else {
            self.register_or_reregister(fd, mask);
        }
    }

    fn register_or_reregister(&self, fd: RawFd, mask: EventMask) {
        let interest = mask_to_interest(mask);
        let mut registered = self.registered_fds.lock().unwrap();
        let poll = self.poll.lock().unwrap();
        let result = if registered.contains(&fd) {
            poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
        } else {
            poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest)
        };
        match result {
            Ok(()) => {
                registered.insert(fd);
            }
            Err(e) => log::warn!("failed to (re)register fd {fd} with the event demultiplexer: {e}"),
        }
    }

    fn deregister_fd(&self, fd: RawFd) {
        let mut registered = self.registered_fds.lock().unwrap();
        if registered.remove(&fd) {
            let poll = self.poll.lock().unwrap();
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    fn drain_wakeup_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.wakeup_read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// One iteration of spec.md §4.4's idle loop, run by the scheduler
    /// whenever a worker has nothing runnable. Realized here as a single
    /// function invoked from the dispatch loop rather than a literal
    /// separate "idle fiber" (see `DESIGN.md` for why that's an
    /// observably equivalent simplification): either way, control returns
    /// to the dispatch loop's own `while` after one bounded poll.
    fn idle_step(self: &Arc<Self>) {
        let deadline = self.timers.next_deadline_ms();
        let wait = if deadline == NO_DEADLINE {
            MAX_EVENT_WAIT
        } else {
            Duration::from_millis(deadline.max(0) as u64).min(MAX_EVENT_WAIT)
        };

        let mut events = Events::with_capacity(256);
        {
            let mut poll = self.poll.lock().unwrap();
            match poll.poll(&mut events, Some(wait)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => log::warn!("event demultiplexer poll failed: {e}"),
            }
        }

        for event in events.iter() {
            if event.token() == WAKEUP_TOKEN {
                self.drain_wakeup_pipe();
                continue;
            }
            let fd = event.token().0 as RawFd;
            let mut ready = EventMask::empty();
            if event.is_readable() {
                ready.insert(EventMask::READ);
            }
            if event.is_writable() {
                ready.insert(EventMask::WRITE);
            }
            let remaining = self.events.fire_ready(fd, ready);
            if remaining.is_empty() {
                self.deregister_fd(fd);
            } else {
                self.register_or_reregister(fd, remaining);
            }
        }

        let mut callbacks = Vec::new();
        self.timers.drain_expired(&mut callbacks);
        for cb in callbacks {
            self.scheduler.schedule_callback(cb, None);
        }
    }
}

impl Drop for IOManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wakeup_read_fd);
            libc::close(self.wakeup_write_fd);
        }
    }
}

fn mask_to_interest(mask: EventMask) -> Interest {
    match (mask.contains(EventMask::READ), mask.contains(EventMask::WRITE)) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => unreachable!("mask_to_interest called with an empty mask"),
    }
}

fn make_wakeup_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn tickle_pipe(fd: RawFd) {
    let byte = [1u8];
    unsafe {
        libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn add_event_then_cancel_wakes_handler_and_clears_counter() {
        let manager = IOManager::new(1, false, "test").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = listener.as_raw_fd();

        let woke = Arc::new(AtomicBool::new(false));
        let w = woke.clone();
        manager
            .add_event(fd, EventKind::Read, Some(Box::new(move || w.store(true, Ordering::SeqCst))))
            .unwrap();
        assert_eq!(manager.pending_event_count(), 1);

        manager.cancel_event(fd, EventKind::Read);
        // cancel_event clears the registration (and the counter) synchronously;
        // the handler itself only runs once a worker drains the callback it was
        // scheduled as, so start the manager to let that happen before checking it.
        assert_eq!(manager.pending_event_count(), 0);
        manager.start();
        manager.stop();
        assert!(woke.load(Ordering::SeqCst));
    }

    #[test]
    fn add_event_twice_fails() {
        let manager = IOManager::new(1, false, "test").unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        manager.add_event(fd, EventKind::Read, Some(Box::new(|| {}))).unwrap();
        let err = manager.add_event(fd, EventKind::Read, Some(Box::new(|| {}))).unwrap_err();
        assert!(matches!(err, crate::Error::AlreadyRegistered { .. }));
    }

    #[test]
    fn recurring_timer_runs_through_the_scheduler() {
        let manager = IOManager::new(2, false, "test").unwrap();
        manager.start();
        let fires = Arc::new(StdMutex::new(0u32));
        let f = fires.clone();
        let handle = manager.timers().add_timer(5, move || { *f.lock().unwrap() += 1; }, true);
        std::thread::sleep(Duration::from_millis(60));
        handle.cancel();
        manager.stop();
        assert!(*fires.lock().unwrap() >= 2);
    }
}
