//! Stackful, cooperatively scheduled units of execution.
//!
//! A fiber owns a private stack and a saved machine context. Resuming a
//! fiber switches onto its stack; the fiber runs until it voluntarily
//! yields (or finishes), at which point control switches back to whichever
//! context resumed it. The switch itself is delegated to [`corosensei`],
//! which does the actual register/stack-pointer swap this module's contract
//! depends on (see `DESIGN.md` for why a crate rather than hand-written
//! assembly is used here).
//!
//! Two states of the world resume a fiber: the scheduler's dispatch loop
//! ([`resume_from_scheduler`]/[`yield_to_scheduler`]) and a thread hosting a
//! single fiber directly, "use-caller" style
//! ([`resume_from_caller`]/[`yield_to_caller`]). Mechanically both pairs do
//! the same `Coroutine::resume`/`Yielder::suspend` dance; they're named
//! separately because mixing them on the same fiber is undefined, per the
//! contract, not because the underlying switch differs.
//!
//! See also:
//! - [`crate::scheduler`], the dispatch loop that drives fibers day to day
//! - [`crate::hook`], which turns blocking I/O into `yield_hold` + later resume

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::scheduler::Scheduler;

/// Default fiber stack size in bytes, matching `fiber.stack_size`'s default
/// in [`crate::config`].
pub const DEFAULT_STACK_SIZE: usize = 131_072;

/// A fiber's lifecycle state. See the module docs and the design's data
/// model for the legal transition diagram: `Init -> Exec`, `Exec ->
/// {Ready, Hold, Term, Except}`, `Ready -> Exec`, `Hold -> Exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Ready,
    Exec,
    Hold,
    Term,
    Except,
}

impl State {
    /// `Term` and `Except` never resume again.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Term | State::Except)
    }
}

/// What a fiber yields with: either "put me back on the ready queue" or
/// "park me, something else will resume me."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Suspend {
    Ready,
    Hold,
}

enum Outcome {
    Ok,
    Except(String),
}

type FiberCoroutine = Coroutine<(), Suspend, Outcome, DefaultStack>;

/// What [`Fiber::resume`] reports back to whoever called it (the
/// scheduler's dispatch loop, or a use-caller host).
pub(crate) enum ResumeOutcome {
    /// The fiber suspended; its state has already been updated to `Ready`
    /// or `Hold` to match.
    Suspended,
    /// The fiber ran to completion or failed; its state is `Term` or
    /// `Except`.
    Finished,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static TOTAL_FIBERS: AtomicUsize = AtomicUsize::new(0);

/// Process-wide count of live [`Fiber`] objects (created, not yet
/// dropped). Not in spec.md's core data model; ported from the teacher's
/// `Fiber::TotalFibers`-style debugging aid, useful for catching fiber
/// leaks in tests.
pub fn total_fibers() -> usize {
    TOTAL_FIBERS.load(Ordering::Relaxed)
}

/// An independently schedulable unit of execution with its own stack.
pub struct Fiber {
    id: u64,
    name: String,
    use_caller: bool,
    state: Mutex<State>,
    /// `None` for the caller fiber (it owns no stack) and, after `reset`,
    /// briefly while being rebuilt.
    coroutine: Mutex<Option<FiberCoroutine>>,
    stack_size: usize,
    /// Set once, at the top of the coroutine's closure, to the address of
    /// the `Yielder` corosensei handed it. `yield_ready`/`yield_hold` read
    /// this through [`current`] to suspend from arbitrary call depth
    /// without threading a fiber handle through every intervening call,
    /// the entire point of a stackful model.
    yielder: Cell<*const Yielder<(), Suspend>>,
}

// SAFETY: `yielder` is only ever dereferenced by the one OS thread that
// currently has this fiber in `State::Exec`; the state machine's "EXEC on
// at most one thread at a time" invariant is what makes moving the `Arc`
// between threads while it's anywhere else sound.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

pub type FiberHandle = Arc<Fiber>;

impl Fiber {
    /// Creates a new fiber with a private stack of `stack_size` bytes,
    /// running `callback` on first resume. Initial state is `Init`.
    pub fn new<F>(name: impl Into<String>, stack_size: usize, callback: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(name, stack_size, false, callback)
    }

    /// Like [`Fiber::new`], but marked for the caller-driven resume/yield
    /// pair (see module docs). Purely documentation of intent: the switch
    /// mechanism is identical either way, but mixing the two calling
    /// conventions on one fiber is a programmer error the contract
    /// disallows.
    pub fn new_use_caller<F>(name: impl Into<String>, stack_size: usize, callback: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        Self::build(name, stack_size, true, callback)
    }

    fn build<F>(name: impl Into<String>, stack_size: usize, use_caller: bool, callback: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        TOTAL_FIBERS.fetch_add(1, Ordering::Relaxed);
        let coroutine = Self::make_coroutine(stack_size, callback);
        Arc::new(Fiber {
            id,
            name: name.into(),
            use_caller,
            state: Mutex::new(State::Init),
            coroutine: Mutex::new(Some(coroutine)),
            stack_size,
            yielder: Cell::new(std::ptr::null()),
        })
    }

    fn make_coroutine<F>(stack_size: usize, callback: F) -> FiberCoroutine
    where
        F: FnOnce() + Send + 'static,
    {
        let stack = DefaultStack::new(stack_size).expect("failed to allocate fiber stack");
        Coroutine::with_stack(stack, move |yielder: &Yielder<(), Suspend>, _first: ()| {
            FIBER_YIELDER.with(|cell| cell.set(yielder as *const _));
            let result = catch_unwind(AssertUnwindSafe(callback));
            FIBER_YIELDER.with(|cell| cell.set(std::ptr::null()));
            match result {
                Ok(()) => Outcome::Ok,
                Err(payload) => Outcome::Except(panic_message(&payload)),
            }
        })
    }

    /// Creates a bare fiber with no stack and no callback, representing a
    /// thread's own original execution. Never resumed or suspended itself:
    /// it's a resumption *identity*, not a runnable unit.
    fn new_caller() -> FiberHandle {
        Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: "<caller>".to_string(),
            use_caller: true,
            state: Mutex::new(State::Exec),
            coroutine: Mutex::new(None),
            stack_size: 0,
            yielder: Cell::new(std::ptr::null()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_use_caller(&self) -> bool {
        self.use_caller
    }

    pub fn state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// True if this is a thread's caller fiber (owns no stack).
    pub fn is_caller(&self) -> bool {
        self.coroutine.lock().unwrap().is_none() && self.stack_size == 0
    }

    /// Re-initializes a fiber in `Term`, `Except`, or `Init` with a new
    /// callback. A fresh stack of the same size is allocated for it (see
    /// `DESIGN.md` for why this crate doesn't literally recycle the old
    /// stack's memory the way the teacher's C allocator-backed fiber cache
    /// does).
    pub fn reset<F>(self: &Arc<Self>, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock().unwrap();
        assert!(
            matches!(*state, State::Init | State::Term | State::Except),
            "cannot reset fiber {} in state {:?}",
            self.id,
            *state
        );
        let mut coroutine = self.coroutine.lock().unwrap();
        *coroutine = Some(Self::make_coroutine(self.stack_size, callback));
        *state = State::Init;
        // The cached yielder pointer was into the coroutine we just replaced;
        // its stack is freed, so the pointer is dangling. Clear it so the next
        // suspend() call re-derives it from FIBER_YIELDER instead of
        // dereferencing stale memory.
        self.yielder.set(std::ptr::null());
    }

    /// Drives this fiber forward once: resumes it if it's runnable, and
    /// reports whether it suspended or finished. Used identically by the
    /// scheduler's dispatch loop (`resume_from_scheduler`) and by
    /// use-caller hosts (`resume_from_caller`).
    pub(crate) fn resume(self: &Arc<Self>) -> ResumeOutcome {
        {
            let mut state = self.state.lock().unwrap();
            assert!(
                matches!(*state, State::Init | State::Ready | State::Hold),
                "cannot resume fiber {} in state {:?}",
                self.id,
                *state
            );
            *state = State::Exec;
        }

        let previous = CURRENT_FIBER.with(|c| c.borrow_mut().replace(self.clone()));
        let result = {
            let mut guard = self.coroutine.lock().unwrap();
            let coro = guard
                .as_mut()
                .expect("resumed a fiber with no coroutine (the caller fiber can't be resumed)");
            coro.resume(())
        };
        CURRENT_FIBER.with(|c| *c.borrow_mut() = previous);

        match result {
            CoroutineResult::Yield(signal) => {
                let mut state = self.state.lock().unwrap();
                *state = match signal {
                    Suspend::Ready => State::Ready,
                    Suspend::Hold => State::Hold,
                };
                ResumeOutcome::Suspended
            }
            CoroutineResult::Return(outcome) => {
                let mut state = self.state.lock().unwrap();
                *state = match &outcome {
                    Outcome::Ok => State::Term,
                    Outcome::Except(_) => State::Except,
                };
                if let Outcome::Except(msg) = outcome {
                    log::error!(
                        "fiber {} ({}) terminated via unhandled error: {msg}\n{}",
                        self.id,
                        self.name,
                        Backtrace::force_capture()
                    );
                }
                ResumeOutcome::Finished
            }
        }
    }

    fn suspend(self: &Arc<Self>, signal: Suspend) {
        let ptr = self.yielder.get();
        // The coroutine sets this on itself from inside its own closure,
        // via the FIBER_YIELDER thread-local, the first time it runs. Copy
        // it onto the `Fiber` the first time we see it so later calls
        // (from arbitrary call depth, not necessarily re-entering through
        // `resume`) can find it without re-deriving it.
        if ptr.is_null() {
            let from_tls = FIBER_YIELDER.with(|cell| cell.get());
            assert!(
                !from_tls.is_null(),
                "yield_ready/yield_hold called outside of a running fiber"
            );
            self.yielder.set(from_tls);
        }
        let yielder = unsafe { &*self.yielder.get() };
        yielder.suspend(signal);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        TOTAL_FIBERS.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

thread_local! {
    static CURRENT_FIBER: RefCell<Option<FiberHandle>> = RefCell::new(None);
    static CALLER_FIBER: RefCell<Option<FiberHandle>> = RefCell::new(None);
    static FIBER_YIELDER: Cell<*const Yielder<(), Suspend>> = Cell::new(std::ptr::null());
}

/// The fiber currently executing on this thread, or this thread's caller
/// fiber if nothing else is running.
pub fn current() -> FiberHandle {
    if let Some(f) = CURRENT_FIBER.with(|c| c.borrow().clone()) {
        return f;
    }
    caller_fiber()
}

/// This thread's caller fiber, creating it on first use. Shared by the
/// thread for its whole lifetime.
pub fn caller_fiber() -> FiberHandle {
    CALLER_FIBER.with(|c| {
        let mut slot = c.borrow_mut();
        if let Some(f) = slot.clone() {
            return f;
        }
        let f = Fiber::new_caller();
        *slot = Some(f.clone());
        f
    })
}

/// Suspends the current fiber, marking it `Ready` so it will be re-enqueued
/// by whoever resumed it.
pub fn yield_ready() {
    current().suspend(Suspend::Ready);
}

/// Suspends the current fiber without re-enqueueing it. The caller
/// promises to resume it later, or it will be resumed by readiness or a
/// timer firing.
pub fn yield_hold() {
    current().suspend(Suspend::Hold);
}

/// Alias for [`Fiber::resume`], named for the use-caller calling
/// convention. See the module docs for why this and
/// [`resume_from_scheduler`] are mechanically identical.
pub(crate) fn resume_from_caller(fiber: &FiberHandle) -> ResumeOutcome {
    fiber.resume()
}

/// Alias for [`Fiber::resume`], named for the scheduler-driven calling
/// convention.
pub(crate) fn resume_from_scheduler(fiber: &FiberHandle) -> ResumeOutcome {
    fiber.resume()
}

/// Suspends the current fiber, to be resumed by the use-caller host rather
/// than the scheduler. Identical to [`yield_hold`]; kept as a separate name
/// to match the contract's two distinct pairs.
pub fn yield_to_caller() {
    yield_hold();
}

/// Suspends the current fiber back to the scheduler's dispatch loop,
/// re-enqueueing it. Identical to [`yield_ready`].
pub fn yield_to_scheduler() {
    yield_ready();
}

////////////////////////////////////////////////////////////////////////////
// Cond: fiber-cooperative condition variable
////////////////////////////////////////////////////////////////////////////

/// A condition variable for fibers: `wait()` parks the calling fiber until
/// `signal()`/`broadcast()` wakes it, without ever blocking the underlying
/// OS thread. Not part of the design's core five subsystems, but
/// supplemented from the teacher's `fiber::Cond` (see `SPEC_FULL.md` §2.1).
///
/// Unlike the OS-level mutex/semaphore/rwlock the design calls out in its
/// concurrency model, `Cond` never blocks a worker thread: waiting is just
/// `yield_hold` plus bookkeeping, and waking is just rescheduling a parked
/// fiber on its own captured scheduler.
#[derive(Default)]
pub struct Cond {
    waiters: Mutex<VecDeque<(FiberHandle, Arc<Scheduler>)>>,
}

impl Cond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the current fiber until woken by `signal`/`broadcast`. Must be
    /// called from within a fiber running under a [`Scheduler`] (panics
    /// otherwise, since there would be no scheduler to reschedule it on).
    pub fn wait(&self) {
        let fiber = current();
        let scheduler = Scheduler::current().expect("Cond::wait called outside of a scheduler");
        self.waiters.lock().unwrap().push_back((fiber, scheduler));
        yield_hold();
    }

    /// Wakes one waiting fiber, if any. Does not yield.
    pub fn signal(&self) {
        if let Some((fiber, scheduler)) = self.waiters.lock().unwrap().pop_front() {
            scheduler.schedule_fiber(fiber, None);
        }
    }

    /// Wakes every waiting fiber. Does not yield.
    pub fn broadcast(&self) {
        let waiters: Vec<_> = self.waiters.lock().unwrap().drain(..).collect();
        for (fiber, scheduler) in waiters {
            scheduler.schedule_fiber(fiber, None);
        }
    }
}
