//! The M:N scheduler: a fixed pool of worker threads draining a single
//! global ready queue of fibers and callbacks.
//!
//! [`crate::io_manager::IOManager`] builds on top of this by embedding a
//! `Scheduler` and plugging in its own idle behavior (poll the event
//! demultiplexer) and termination guard (also require no pending events or
//! timers) through [`Scheduler::set_idle_hook`] and
//! [`Scheduler::set_termination_guard`]. Rust has no virtual inheritance,
//! so "IOManager is-a Scheduler with extra behavior" is modeled as
//! composition plus these two injection points rather than subclassing, per
//! the design's note on replacing virtual dispatch with closed composition.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::fiber::{self, Fiber, FiberHandle};

/// One item on the ready queue: a fiber or a standalone callback, plus an
/// optional worker pin. Mirrors the design's "scheduler task queue entry."
pub enum Schedulable {
    Fiber(FiberHandle),
    Callback(Box<dyn FnOnce() + Send + 'static>),
}

impl From<FiberHandle> for Schedulable {
    fn from(fiber: FiberHandle) -> Self {
        Schedulable::Fiber(fiber)
    }
}

struct QueueEntry {
    task: Schedulable,
    pin: Option<usize>,
}

pub struct Scheduler {
    name: String,
    thread_count: usize,
    use_caller: bool,
    stack_size: usize,
    queue: spin::Mutex<VecDeque<QueueEntry>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    active_thread_count: AtomicUsize,
    idle_thread_count: AtomicUsize,
    idle_cv: Condvar,
    idle_mutex: Mutex<()>,
    idle_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    wakeup_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
    termination_guard: Mutex<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
}

thread_local! {
    static CURRENT_SCHEDULER: RefCell<Option<Arc<Scheduler>>> = RefCell::new(None);
    static CALLBACK_FIBER: RefCell<Option<FiberHandle>> = RefCell::new(None);
}

impl Scheduler {
    /// `thread_count` total worker slots; if `use_caller`, one of those
    /// slots is the thread that calls `stop()` rather than a spawned
    /// thread, matching spec.md §4.2's `start()` contract.
    pub fn new(thread_count: usize, use_caller: bool, name: impl Into<String>) -> Arc<Scheduler> {
        assert!(thread_count > 0, "scheduler needs at least one thread");
        let stack_size = crate::config::get_or("fiber.stack_size", fiber::DEFAULT_STACK_SIZE as u32) as usize;
        Arc::new(Scheduler {
            name: name.into(),
            thread_count,
            use_caller,
            stack_size,
            queue: spin::Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            active_thread_count: AtomicUsize::new(0),
            idle_thread_count: AtomicUsize::new(0),
            idle_cv: Condvar::new(),
            idle_mutex: Mutex::new(()),
            idle_hook: Mutex::new(None),
            wakeup_hook: Mutex::new(None),
            termination_guard: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active_thread_count(&self) -> usize {
        self.active_thread_count.load(Ordering::SeqCst)
    }

    pub fn idle_thread_count(&self) -> usize {
        self.idle_thread_count.load(Ordering::SeqCst)
    }

    /// The scheduler that owns the calling thread, if any. `None` on a
    /// thread that never ran a dispatch loop.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT_SCHEDULER.with(|c| c.borrow().clone())
    }

    /// This thread's caller fiber. A thin forwarding method so callers
    /// holding a `Scheduler` handle don't also need `crate::fiber`'s free
    /// function (ported from the original's `Scheduler::GetMainFiber()`).
    pub fn caller_fiber(&self) -> FiberHandle {
        fiber::caller_fiber()
    }

    /// Plugs in IOManager's idle behavior. Called once, before `start()`.
    pub(crate) fn set_idle_hook(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.idle_hook.lock().unwrap() = Some(f);
    }

    /// Plugs in IOManager's "also require no pending events/timers"
    /// termination check.
    pub(crate) fn set_termination_guard(&self, f: Box<dyn Fn() -> bool + Send + Sync>) {
        *self.termination_guard.lock().unwrap() = Some(f);
    }

    /// Plugs in IOManager's wakeup-pipe write, invoked alongside the
    /// default condvar notification whenever `tickle()` is called.
    pub(crate) fn set_wakeup_hook(&self, f: Box<dyn Fn() + Send + Sync>) {
        *self.wakeup_hook.lock().unwrap() = Some(f);
    }

    /// Spawns `thread_count - (use_caller ? 1 : 0)` worker threads, each
    /// running the dispatch loop.
    pub fn start(self: &Arc<Self>) {
        assert!(
            !self.started.swap(true, Ordering::SeqCst),
            "scheduler '{}' already started",
            self.name
        );
        let worker_count = self.thread_count - if self.use_caller { 1 } else { 0 };
        let mut workers = self.workers.lock().unwrap();
        for id in 0..worker_count {
            let scheduler = self.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{id}", self.name))
                .spawn(move || scheduler.dispatch_loop(id))
                .expect("failed to spawn scheduler worker thread");
            workers.push(handle);
        }
    }

    /// Requests termination; returns once the queue has drained and every
    /// worker is idle (and, for an `IOManager`, no events or timers
    /// remain). In use-caller mode this runs the dispatch loop on the
    /// calling thread until that point.
    pub fn stop(self: &Arc<Self>) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.tickle();
        if self.use_caller {
            self.dispatch_loop(self.thread_count - 1);
        }
        let handles = {
            let mut workers = self.workers.lock().unwrap();
            std::mem::take(&mut *workers)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Enqueues a fiber or callback, optionally pinned to worker `thread`.
    pub fn schedule(self: &Arc<Self>, item: Schedulable, thread: Option<usize>) {
        self.queue.lock().push_back(QueueEntry { task: item, pin: thread });
        self.tickle();
    }

    /// Enqueues every item from `items`, each unpinned.
    pub fn schedule_batch<I: IntoIterator<Item = Schedulable>>(self: &Arc<Self>, items: I) {
        {
            let mut queue = self.queue.lock();
            for task in items {
                queue.push_back(QueueEntry { task, pin: None });
            }
        }
        self.tickle();
    }

    pub(crate) fn schedule_fiber(self: &Arc<Self>, fiber: FiberHandle, thread: Option<usize>) {
        self.schedule(Schedulable::Fiber(fiber), thread);
    }

    pub(crate) fn schedule_callback(self: &Arc<Self>, cb: Box<dyn FnOnce() + Send + 'static>, thread: Option<usize>) {
        self.schedule(Schedulable::Callback(cb), thread);
    }

    /// Writes a wakeup to whatever is parked in the idle step: the default
    /// condvar, and (for an `IOManager`) the wakeup pipe.
    pub fn tickle(&self) {
        self.idle_cv.notify_all();
        if let Some(hook) = self.wakeup_hook.lock().unwrap().as_ref() {
            hook();
        }
    }

    fn should_terminate(&self) -> bool {
        let base = self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().is_empty()
            && self.active_thread_count.load(Ordering::SeqCst) == 0;
        if !base {
            return false;
        }
        match self.termination_guard.lock().unwrap().as_ref() {
            Some(guard) => guard(),
            None => true,
        }
    }

    /// Front-to-back search for the first entry runnable on `worker_id`:
    /// unpinned, or pinned to this worker, and (if a fiber) not currently
    /// `EXEC`. Entries skipped because they're pinned elsewhere set the
    /// "wake others" flag so that worker gets a chance to pick them up.
    fn take_runnable(&self, worker_id: usize) -> (Option<QueueEntry>, bool) {
        let mut queue = self.queue.lock();
        let mut wake_others = false;
        let mut found = None;
        for i in 0..queue.len() {
            let entry = &queue[i];
            let pin_ok = entry.pin.map_or(true, |w| w == worker_id);
            if !pin_ok {
                wake_others = true;
                continue;
            }
            if let Schedulable::Fiber(f) = &entry.task {
                if f.state() == fiber::State::Exec {
                    continue;
                }
            }
            found = Some(i);
            break;
        }
        let entry = found.and_then(|i| queue.remove(i));
        (entry, wake_others)
    }

    fn callback_fiber(&self, cb: Box<dyn FnOnce() + Send + 'static>) -> FiberHandle {
        CALLBACK_FIBER.with(|slot| {
            let mut slot = slot.borrow_mut();
            match slot.take() {
                Some(fiber) => {
                    fiber.reset(cb);
                    fiber
                }
                None => Fiber::new("callback", self.stack_size, move || cb()),
            }
        })
    }

    fn dispatch_loop(self: &Arc<Self>, worker_id: usize) {
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = Some(self.clone()));
        let hooks_were_enabled = crate::hook::hooks_enabled();
        crate::hook::set_hooks_enabled(true);
        while !self.should_terminate() {
            let (entry, wake_others) = self.take_runnable(worker_id);
            if wake_others {
                self.tickle();
            }
            match entry {
                Some(QueueEntry { task: Schedulable::Fiber(f), pin }) => {
                    if f.state().is_terminal() {
                        continue;
                    }
                    self.active_thread_count.fetch_add(1, Ordering::SeqCst);
                    let outcome = fiber::resume_from_scheduler(&f);
                    self.active_thread_count.fetch_sub(1, Ordering::SeqCst);
                    if let fiber::ResumeOutcome::Suspended = outcome {
                        match f.state() {
                            fiber::State::Ready => self.schedule_fiber(f, pin),
                            fiber::State::Hold => {}
                            other => {
                                log::warn!(
                                    "fiber {} suspended in unexpected state {other:?}, coercing to HOLD",
                                    f.id()
                                );
                            }
                        }
                    }
                }
                Some(QueueEntry { task: Schedulable::Callback(cb), .. }) => {
                    let fiber = self.callback_fiber(cb);
                    self.active_thread_count.fetch_add(1, Ordering::SeqCst);
                    let outcome = fiber::resume_from_scheduler(&fiber);
                    self.active_thread_count.fetch_sub(1, Ordering::SeqCst);
                    debug_assert!(
                        matches!(outcome, fiber::ResumeOutcome::Finished),
                        "callback fibers never yield"
                    );
                    CALLBACK_FIBER.with(|slot| *slot.borrow_mut() = Some(fiber));
                }
                None => {
                    self.idle_thread_count.fetch_add(1, Ordering::SeqCst);
                    self.idle_once();
                    self.idle_thread_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        crate::hook::set_hooks_enabled(hooks_were_enabled);
        CURRENT_SCHEDULER.with(|c| *c.borrow_mut() = None);
    }

    fn idle_once(&self) {
        let hook = self.idle_hook.lock().unwrap();
        if let Some(f) = hook.as_ref() {
            f();
            return;
        }
        drop(hook);
        let guard = self.idle_mutex.lock().unwrap();
        let _ = self.idle_cv.wait_timeout(guard, Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn schedule_runs_callback() {
        let scheduler = Scheduler::new(2, false, "test");
        scheduler.start();
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        scheduler.schedule(Schedulable::Callback(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })), None);
        scheduler.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fiber_yield_ready_is_requeued_and_runs_to_completion() {
        let scheduler = Scheduler::new(2, false, "test");
        scheduler.start();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        let fiber = Fiber::new("f", 65536, move || {
            o.lock().unwrap().push(1);
            fiber::yield_ready();
            o.lock().unwrap().push(2);
        });
        scheduler.schedule_fiber(fiber, None);
        scheduler.stop();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    #[should_panic(expected = "already started")]
    fn double_start_panics() {
        let scheduler = Scheduler::new(1, false, "test");
        scheduler.start();
        scheduler.start();
    }
}
