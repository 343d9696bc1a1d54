//! Per-descriptor event table.
//!
//! This is the data model from the design's "Descriptor event context":
//! an index-addressable table, keyed by file descriptor, of which
//! read/write events are currently registered and what to do when they
//! fire. [`crate::io_manager::IOManager`] owns one table and is the only
//! thing that mutates it; [`crate::hook`] only ever reaches it through
//! `IOManager`'s `add_event`/`del_event`/`cancel_event`/`cancel_all`.

use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock};

use bitflags::bitflags;

use crate::fiber::FiberHandle;
use crate::scheduler::Scheduler;

bitflags! {
    /// Which half of a descriptor an event registration is about.
    pub struct EventMask: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// A single bit of [`EventMask`], named the way the API talks about
/// individual registrations (`add_event(fd, EventKind::Read, ..)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

impl EventKind {
    pub(crate) fn mask(self) -> EventMask {
        match self {
            EventKind::Read => EventMask::READ,
            EventKind::Write => EventMask::WRITE,
        }
    }
}

/// Why a [`Handler`] fired: genuine readiness seen by the idle loop, or an
/// explicit `cancel_event`/`cancel_all` call. `Handler::Callback` closures
/// that care about the difference (namely [`crate::hook::do_io`], to
/// implement "a cancelled read returns interrupted, not a retry") take this
/// as their argument; nothing else in the table needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireReason {
    Ready,
    Cancelled,
}

/// What to run when an event fires: either reschedule a parked fiber, or
/// invoke a standalone callback. Mirrors the design's "either a fiber or a
/// callback" task-queue entry, but for event handlers specifically.
pub enum Handler {
    Fiber(FiberHandle),
    Callback(Box<dyn FnOnce(FireReason) + Send>),
}

impl Handler {
    /// Hand this handler off to its captured scheduler. For a fiber this
    /// re-enqueues it (it was parked in `HOLD`); a bare fiber capture has
    /// no use for `reason`, since the resume value itself carries no
    /// payload; for a callback, `reason` is threaded through so it can
    /// distinguish readiness from cancellation before rescheduling whoever
    /// it's waiting for.
    pub(crate) fn fire(self, scheduler: &Arc<Scheduler>, reason: FireReason) {
        match self {
            Handler::Fiber(fiber) => scheduler.schedule_fiber(fiber, None),
            Handler::Callback(cb) => scheduler.schedule_callback(Box::new(move || cb(reason)), None),
        }
    }
}

/// One registered (fd, read|write) handler: which scheduler to resume on,
/// and what to resume. `None` means the bit isn't registered, per the
/// design's invariant that a sub-context is populated iff the corresponding
/// mask bit is set.
#[derive(Default)]
struct EventContext {
    scheduler: Option<Arc<Scheduler>>,
    handler: Option<Handler>,
}

/// Per-descriptor event bookkeeping: which bits are registered, and the
/// read/write sub-contexts.
#[derive(Default)]
pub(crate) struct FdContext {
    fd: RawFd,
    events: EventMask,
    read: EventContext,
    write: EventContext,
}

impl FdContext {
    fn context_mut(&mut self, kind: EventKind) -> &mut EventContext {
        match kind {
            EventKind::Read => &mut self.read,
            EventKind::Write => &mut self.write,
        }
    }

    fn take(&mut self, kind: EventKind) -> Option<(Arc<Scheduler>, Handler)> {
        let ctx = self.context_mut(kind);
        self.events.remove(kind.mask());
        match (ctx.scheduler.take(), ctx.handler.take()) {
            (Some(s), Some(h)) => Some((s, h)),
            _ => None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn events(&self) -> EventMask {
        self.events
    }
}

/// The event table itself: an index-addressable vector keyed by descriptor
/// number, grown on demand, guarded by a reader/writer lock for resizes
/// plus a per-entry mutex for the mutation that actually matters (per the
/// design's concurrency model: "reader/writer lock for table resize,
/// per-entry operations use a per-entry mutex").
#[derive(Default)]
pub(crate) struct EventTable {
    entries: RwLock<Vec<Option<Arc<Mutex<FdContext>>>>>,
}

impl EventTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entry(&self, fd: RawFd) -> Arc<Mutex<FdContext>> {
        let idx = fd as usize;
        {
            let entries = self.entries.read().unwrap();
            if let Some(Some(entry)) = entries.get(idx) {
                return entry.clone();
            }
        }
        let mut entries = self.entries.write().unwrap();
        if entries.len() <= idx {
            entries.resize_with(idx + 1, || None);
        }
        entries[idx]
            .get_or_insert_with(|| {
                Arc::new(Mutex::new(FdContext {
                    fd,
                    ..Default::default()
                }))
            })
            .clone()
    }

    /// Registers `kind` on `fd`, capturing either the provided callback or
    /// (if none) the currently executing fiber. Fails with
    /// [`crate::error::Error::AlreadyRegistered`] if the bit is already
    /// set, per the design's "attempting to add an event already present
    /// fails."
    pub(crate) fn add(
        &self,
        fd: RawFd,
        kind: EventKind,
        scheduler: Arc<Scheduler>,
        handler: Handler,
    ) -> crate::Result<()> {
        let entry = self.entry(fd);
        let mut ctx = entry.lock().unwrap();
        if ctx.events.contains(kind.mask()) {
            return Err(crate::Error::AlreadyRegistered { fd, event: kind });
        }
        ctx.events.insert(kind.mask());
        let slot = ctx.context_mut(kind);
        slot.scheduler = Some(scheduler);
        slot.handler = Some(handler);
        Ok(())
    }

    /// The event mask currently registered for `fd`, used by `IOManager`
    /// to decide whether the demultiplexer needs `register` (first
    /// interest) or `reregister` (interest changed) after `add`/`fire_ready`.
    pub(crate) fn mask_of(&self, fd: RawFd) -> EventMask {
        let entry = self.entry(fd);
        let ctx = entry.lock().unwrap();
        ctx.events()
    }

    /// Removes `kind` from `fd` without invoking its handler.
    pub(crate) fn del(&self, fd: RawFd, kind: EventKind) {
        let entry = self.entry(fd);
        let mut ctx = entry.lock().unwrap();
        ctx.take(kind);
    }

    /// Removes `kind` from `fd` and fires its handler, if any was
    /// registered. This is the canonical way to wake a fiber parked on
    /// this event from somewhere other than readiness.
    pub(crate) fn cancel(&self, fd: RawFd, kind: EventKind) {
        let taken = {
            let entry = self.entry(fd);
            let mut ctx = entry.lock().unwrap();
            ctx.take(kind)
        };
        if let Some((scheduler, handler)) = taken {
            handler.fire(&scheduler, FireReason::Cancelled);
        }
    }

    /// Fires every pending handler for `fd` (both read and write, whichever
    /// are registered), used by `close`.
    pub(crate) fn cancel_all(&self, fd: RawFd) {
        self.cancel(fd, EventKind::Read);
        self.cancel(fd, EventKind::Write);
    }

    /// Fires the handlers whose bits are set in `ready`, for events that
    /// are actually registered (`ready ∩ registered`), clearing those bits.
    /// Returns the bits that remain registered afterwards, so the idle
    /// loop knows whether to re-arm the descriptor with the demultiplexer
    /// or drop it entirely.
    pub(crate) fn fire_ready(&self, fd: RawFd, ready: EventMask) -> EventMask {
        let mut fired = Vec::new();
        let remaining = {
            let entry = self.entry(fd);
            let mut ctx = entry.lock().unwrap();
            let real = ready & ctx.events;
            for kind in [EventKind::Read, EventKind::Write] {
                if real.contains(kind.mask()) {
                    if let Some(pair) = ctx.take(kind) {
                        fired.push(pair);
                    }
                }
            }
            ctx.events
        };
        for (scheduler, handler) in fired {
            handler.fire(&scheduler, FireReason::Ready);
        }
        remaining
    }

    /// Total number of set bits across every descriptor's event mask,
    /// recomputed on demand. Used both by tests asserting the pending-event
    /// count invariant and by `IOManager`'s termination guard ("no pending
    /// events").
    pub(crate) fn total_registered(&self) -> u32 {
        let entries = self.entries.read().unwrap();
        entries
            .iter()
            .flatten()
            .map(|e| e.lock().unwrap().events().bits().count_ones())
            .sum()
    }
}
